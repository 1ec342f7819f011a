//! vtshell - a virtual terminal engine and an inline terminal host
//!
//! The engine lives in [`core::term`]: feed it the output of a program and it
//! keeps a screen of cells up to date, telling an [`core::term::Observer`]
//! what changed. [`core::session`] runs a child on a pseudo terminal and pumps
//! its output through the engine, and [`ui`] draws the result inline.

pub mod config;
pub mod core;
pub mod ui;
