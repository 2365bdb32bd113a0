//! Built-in cool-off strategies. Each strategy is an `Iterator<Item =
//! Duration>`; combinators like `take(n)` bound the number of retries.

pub mod exponential;
pub mod fixed;
