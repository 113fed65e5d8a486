//! Data loading, splitting and batching.

pub mod batch;
pub mod idx;
pub mod split;

pub use batch::{Batch, Batches, Dataset};
pub use idx::{MnistSplit, load_mnist};
pub use split::{split_counts, split_data, split_indices};
