//! Bundled scanners. Most recognizers live outside this crate; the gzip
//! scanner ships here because it exercises the recursion contract.

pub mod gzip;

pub use gzip::GzipScanner;
