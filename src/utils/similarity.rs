//! 特征提取与检索共用的向量计算

/// 除法前加到范数上的小量
pub const NORM_EPSILON: f32 = 1e-7;

pub const COSINE_WEIGHT: f32 = 0.5;
pub const EUCLIDEAN_WEIGHT: f32 = 0.3;
pub const CORRELATION_WEIGHT: f32 = 0.2;

#[inline]
fn dot_product(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum()
}

#[inline]
fn l2_norm(v: &[f32]) -> f64 {
    v.iter().map(|x| f64::from(*x) * f64::from(*x)).sum::<f64>().sqrt()
}

/// 缩放为单位长度，除以 `‖v‖ + ε`
pub fn l2_normalize(values: &mut [f32]) {
    let norm = l2_norm(values) as f32 + NORM_EPSILON;
    for value in values.iter_mut() {
        *value /= norm;
    }
}

/// `1 - 余弦距离`；任一向量范数为零时返回 0.0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot_product(a, b) / (norm_a * norm_b)) as f32
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = f64::from(*x) - f64::from(*y);
            d * d
        })
        .sum::<f64>()
        .sqrt() as f32
}

/// Pearson 相关系数；任一侧方差为零时返回 0.0
pub fn pearson_correlation(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let mean_a = a[..n].iter().map(|x| f64::from(*x)).sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().map(|x| f64::from(*x)).sum::<f64>() / n as f64;

    let mut cov = 0.0_f64;
    let mut var_a = 0.0_f64;
    let mut var_b = 0.0_f64;
    for (x, y) in a[..n].iter().zip(b[..n].iter()) {
        let da = f64::from(*x) - mean_a;
        let db = f64::from(*y) - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    let denom = (var_a * var_b).sqrt();
    if denom == 0.0 || !denom.is_finite() {
        return 0.0;
    }
    (cov / denom).clamp(-1.0, 1.0) as f32
}

/// 三项指标的加权和
#[inline]
pub fn combine_scores(cosine: f32, inverse_euclidean: f32, correlation: f32) -> f32 {
    COSINE_WEIGHT * cosine + EUCLIDEAN_WEIGHT * inverse_euclidean + CORRELATION_WEIGHT * correlation
}

/// 查询向量与库中向量的综合相似度
pub fn combined_similarity(query: &[f32], stored: &[f32]) -> f32 {
    let cosine = cosine_similarity(query, stored);
    let inverse_euclidean = 1.0 / (1.0 + euclidean_distance(query, stored));
    let correlation = pearson_correlation(query, stored);
    combine_scores(cosine, inverse_euclidean, correlation)
}
