//! Shared numeric and address conversions.

pub mod conversions;
