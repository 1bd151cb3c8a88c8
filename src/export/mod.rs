//! Ways to present what a [`Store`](crate::store::Store) has aggregated.
//!
//! - [`view`] renders current stacks and full trees as text tables for live display.
//! - [`json`] turns snapshots into the `{name, value, children}` tree web views consume.
//! - [`speedscope`] builds [speedscope](https://www.speedscope.app) files straight from records.

pub mod json;
pub mod speedscope;
pub mod view;
