pub mod instruments;
pub mod lockfree;
pub mod materials;
pub mod medium;
pub mod packet;
pub mod process;
pub mod random;
pub mod recorder;
pub mod simulation;
pub mod units;
pub mod wavelengths;
