//! Harmonic Token Projection (HTP)
//!
//! Deterministic, training-free text embedding: each token is read as a
//! base-2^16 integer, reduced modulo a set of coprime moduli, and every
//! residue is projected onto the unit circle. Token vectors are mean-pooled
//! and L2 normalised. No model file and no network access are needed, which
//! makes this the fallback when no remote credential is configured.
//!
//! See "Harmonic Token Projection: A Vocabulary-Free, Training-Free,
//! Deterministic, and Reversible Embedding Methodology",
//! https://arxiv.org/html/2511.20665

use std::f64::consts::PI;

/// Two components (sin, cos) per modulus
pub const EMBEDDING_DIM: usize = 384;

const NUM_MODULI: usize = EMBEDDING_DIM / 2;

/// Unicode code points per token that contribute to its integer
const MAX_TOKEN_LENGTH: usize = 64;

/// First 192 primes
static COPRIME_MODULI: &[u64] = &[
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71,
    73, 79, 83, 89, 97, 101, 103, 107, 109, 113, 127, 131, 137, 139, 149, 151,
    157, 163, 167, 173, 179, 181, 191, 193, 197, 199, 211, 223, 227, 229, 233,
    239, 241, 251, 257, 263, 269, 271, 277, 281, 283, 293, 307, 311, 313, 317,
    331, 337, 347, 349, 353, 359, 367, 373, 379, 383, 389, 397, 401, 409, 419,
    421, 431, 433, 439, 443, 449, 457, 461, 463, 467, 479, 487, 491, 499, 503,
    509, 521, 523, 541, 547, 557, 563, 569, 571, 577, 587, 593, 599, 601, 607,
    613, 617, 619, 631, 641, 643, 647, 653, 659, 661, 673, 677, 683, 691, 701,
    709, 719, 727, 733, 739, 743, 751, 757, 761, 769, 773, 787, 797, 809, 811,
    821, 823, 827, 829, 839, 853, 857, 859, 863, 877, 881, 883, 887, 907, 911,
    919, 929, 937, 941, 947, 953, 967, 971, 977, 983, 991, 997, 1009, 1013,
    1019, 1021, 1031, 1033, 1039, 1049, 1051, 1061, 1063, 1069, 1087, 1091,
    1093, 1097, 1103, 1109, 1117, 1123, 1129, 1151, 1153, 1163, 1171, 1181,
];

pub struct HtpModel {
    moduli: &'static [u64],
}

impl HtpModel {
    pub fn new() -> Self {
        Self {
            moduli: &COPRIME_MODULI[..NUM_MODULI],
        }
    }

    /// Embed `text`; text without any token maps to the zero vector
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut sum = vec![0.0f64; EMBEDDING_DIM];
        let mut count = 0usize;

        for token in tokenize(text) {
            let n = token_to_integer(&token);
            for (i, &m) in self.moduli.iter().enumerate() {
                let theta = 2.0 * PI * ((n % m) as f64) / (m as f64);
                sum[2 * i] += theta.sin();
                sum[2 * i + 1] += theta.cos();
            }
            count += 1;
        }

        // Mean pooling is a uniform scale, so normalising the sum is equivalent
        let norm = sum.iter().map(|x| x * x).sum::<f64>().sqrt();
        if count == 0 || norm == 0.0 {
            return vec![0.0; EMBEDDING_DIM];
        }
        sum.iter().map(|x| (x / norm) as f32).collect()
    }
}

impl Default for HtpModel {
    fn default() -> Self {
        Self::new()
    }
}

/// N = sum(u_j * 2^16^(L-j)), wrapping on overflow
fn token_to_integer(token: &str) -> u64 {
    token
        .chars()
        .take(MAX_TOKEN_LENGTH)
        .fold(0u64, |n, c| n.wrapping_mul(65536).wrapping_add(c as u64))
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
}
