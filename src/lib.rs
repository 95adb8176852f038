//! A YAFFS-style flash filesystem with a POSIX-like "direct" interface.
//!
//! The layers, bottom up: [nand] (raw pages and blocks), [chunk] (tagged chunks), [guts] (the
//! object graph and its checkpoint), and [fs] (mount points, handles, paths, and the calls
//! themselves).

pub mod chunk;
pub mod error;
pub mod fs;
pub mod guts;
pub mod nand;
