//! Elo-style ratings and rating-weighted opponent sampling

use rand::Rng;

pub const ELO_K: f32 = 30.0;
pub const ELO_SCALE: f32 = 400.0;

/// How many of the strongest models stay in the sampling pool.
pub const SAMPLE_POOL: usize = 24;

/// Rating adjustment for one result.
///
/// `diff` is opponent rating minus own rating; `reward` > 0 counts as a
/// win, < 0 as a loss, anything else as a draw.
pub fn elo_adjustment(reward: f32, diff: f32) -> f32 {
    let offset = if reward > 0.0 {
        1.0
    } else if reward < 0.0 {
        0.0
    } else {
        0.5
    };
    ELO_K * (offset - 1.0 / (1.0 + 10f32.powf(diff / ELO_SCALE)))
}

/// Draw a model id with probability proportional to
/// `exp((rating - max_rating) / scale)`, restricted to the top
/// [`SAMPLE_POOL`] entries.
pub fn sample_rating_weighted<R: Rng>(
    models: &[(String, f32)],
    rng: &mut R,
) -> Option<String> {
    if models.is_empty() {
        return None;
    }
    let max = models
        .iter()
        .map(|(_, r)| *r)
        .fold(f32::NEG_INFINITY, f32::max);

    let mut scores: Vec<(f64, &str)> = models
        .iter()
        .map(|(id, rating)| (f64::from((rating - max) / ELO_SCALE).exp(), id.as_str()))
        .collect();
    scores.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    scores.truncate(SAMPLE_POOL);

    let sum: f64 = scores.iter().map(|(v, _)| v).sum();
    let mut draw = rng.gen_range(0.0..1.0) * sum;
    for (weight, id) in &scores {
        draw -= weight;
        if draw <= 0.0 {
            return Some((*id).to_string());
        }
    }
    scores.last().map(|(_, id)| (*id).to_string())
}
