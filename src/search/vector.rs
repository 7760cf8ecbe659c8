/// Encode an embedding as a little-endian f32 BLOB
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Parse embedding BLOB to Vec<f32>
///
/// Returns None when the BLOB length is not a multiple of 4.
pub fn parse_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }

    blob.chunks(4)
        .map(|bytes| {
            let arr: [u8; 4] = bytes.try_into().ok()?;
            Some(f32::from_le_bytes(arr))
        })
        .collect()
}

/// Cosine similarity between two vectors of equal length.
///
/// Returns 0.0 if the lengths differ or either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

/// Score `candidates` against `query` and keep the best `k` at or above `min_score`.
///
/// Candidates whose dimension differs from the query are skipped. Results are
/// ordered by descending score; ties keep candidate order.
pub fn rank_top_k<'a, T, I>(query: &[f32], candidates: I, k: usize, min_score: f32) -> Vec<(f32, &'a T)>
where
    I: IntoIterator<Item = (&'a T, &'a [f32])>,
    T: 'a,
{
    let mut scored: Vec<(f32, &'a T)> = candidates
        .into_iter()
        .filter(|(_, embedding)| embedding.len() == query.len())
        .map(|(item, embedding)| (cosine_similarity(query, embedding), item))
        .filter(|(score, _)| *score >= min_score)
        .collect();

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![1.0, 0.0, 0.0];
        let similarity = cosine_similarity(&a, &a);
        assert!((similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let similarity = cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]);
        assert!(similarity.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let similarity = cosine_similarity(&[1.0, 0.0, 0.0], &[-1.0, 0.0, 0.0]);
        assert!((similarity + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_magnitude_and_mismatch() {
        assert_eq!(cosine_similarity(&[0.0, 0.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_cosine_similarity_different_magnitudes() {
        let similarity = cosine_similarity(&[1.0, 0.0, 0.0], &[2.0, 0.0, 0.0]);
        assert!((similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_encode_then_parse_embedding() {
        let floats = vec![1.0f32, -2.5, 3.25, 768.0];
        let blob = encode_embedding(&floats);
        assert_eq!(blob.len(), 16);
        assert_eq!(parse_embedding(&blob), Some(floats));
    }

    #[test]
    fn test_parse_embedding_invalid_length() {
        assert!(parse_embedding(&[0u8, 1, 2, 3, 4]).is_none());
        assert_eq!(parse_embedding(&[]), Some(Vec::new()));
    }

    #[test]
    fn test_rank_top_k_orders_filters_and_truncates() {
        let items = vec![
            ("east", vec![1.0f32, 0.0]),
            ("north", vec![0.0f32, 1.0]),
            ("north-east", vec![1.0f32, 1.0]),
            ("west", vec![-1.0f32, 0.0]),
            ("wrong-dim", vec![1.0f32, 0.0, 0.0]),
        ];
        let candidates = items.iter().map(|(name, emb)| (name, emb.as_slice()));

        let ranked = rank_top_k(&[1.0, 0.2], candidates, 2, 0.0);
        let names: Vec<&str> = ranked.iter().map(|(_, name)| **name).collect();
        assert_eq!(names, vec!["east", "north-east"]);
        assert!(ranked[0].0 >= ranked[1].0);
    }

    #[test]
    fn test_rank_top_k_min_score() {
        let items = vec![("a", vec![1.0f32, 0.0]), ("b", vec![0.0f32, 1.0])];
        let ranked = rank_top_k(&[1.0, 0.0], items.iter().map(|(n, e)| (n, e.as_slice())), 5, 0.5);
        assert_eq!(ranked.len(), 1);
        assert_eq!(*ranked[0].1, "a");
    }
}
