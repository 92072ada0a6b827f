// This crate centralizes the wire protocol spoken between the Core daemon
// and its Tray and GUI satellites.

pub mod framing; // length-delimited frame codec, with legacy-mode detection
pub mod messages; // typed command envelope shared by Tray, GUI, and Core
