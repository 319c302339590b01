//! Small parsing and formatting helpers

pub mod helper;
