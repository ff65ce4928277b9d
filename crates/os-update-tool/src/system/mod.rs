//! Inspection of the live system: block devices, protection mode, UKIs.

pub mod blkdev;
pub mod protection;
pub mod uki;
