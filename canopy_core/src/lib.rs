extern crate canopy_hal;
extern crate serde;

pub mod core;
pub mod trace;
pub mod cfg;
pub mod util;
pub mod measurement;
pub mod driver;
pub mod lock;
pub mod io;
pub mod conditional;
pub mod input;
pub mod persistence;
pub mod daemon;
