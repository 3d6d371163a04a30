//! Random effect trait definitions

/// Random source collaborator
pub trait RandomEffects: Send {
    /// Fill `dest` with random bytes
    fn fill_bytes(&mut self, dest: &mut [u8]);
}
