//! Hammering abstraction.
//!
//! A hammerer repeatedly activates aggressor rows to induce bit flips in
//! their neighbors. Implementations differ in how the access sequence is
//! produced and executed; the fuzzer's jitted pattern hammerer lives in
//! `sledge-fuzzer`.

/// The Hammering trait. A hammerer must implement this trait to perform hammering.
pub trait Hammering {
    /// Error reported when a hammering run cannot be executed.
    type Error: std::error::Error;
    /// Runs one hammering pass over the configured access sequence.
    fn hammer(&self) -> Result<(), Self::Error>;
}
