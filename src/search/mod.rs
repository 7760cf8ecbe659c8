pub mod vector;

pub use vector::{cosine_similarity, encode_embedding, parse_embedding, rank_top_k};
