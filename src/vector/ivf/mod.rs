//! Inverted-file ANN indices: coarse k-means quantizer, flat IVF, and
//! PQ-compressed IVF.

pub mod index;
pub mod kmeans;
pub mod pq;

pub use index::{CombineMode, IvfConfig, IvfIndex, SearchOptions, SearchResult};
pub use kmeans::{kmeans, KMeansConfig, KMeansResult};
pub use pq::{IvfPqConfig, IvfPqIndex, ProductQuantizer};
