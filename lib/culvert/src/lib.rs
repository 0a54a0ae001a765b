#![allow(clippy::new_without_default)]

pub mod net;
