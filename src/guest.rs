use crate::error::Error;
use crate::mem::MemBuffer;

/// The instantiated module's exported surface, as consumed by the driver.
/// Methods take `&self`: guests call back into the import surface from
/// inside `run`/`resume`, so state lives behind interior mutability.
pub trait GuestModule {
    /// The program entry point. `argc`/`argv` follow the layout produced by
    /// the driver's argument writer.
    fn run(&self, argc: i32, argv: i32) -> Result<(), Error>;

    /// Re-entry used to deliver timeout and callback events.
    fn resume(&self) -> Result<(), Error>;

    /// The guest's current stack pointer.
    fn getsp(&self) -> u32;

    /// Handle to the guest's current linear-memory buffer.
    fn memory(&self) -> MemBuffer;
}
