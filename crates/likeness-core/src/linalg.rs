//! Small dense linear algebra: symmetric eigendecomposition and PCA.
//!
//! Subspace models only ever decompose n×n Gram or scatter matrices, where n is
//! the number of training samples or retained components, so a cyclic Jacobi
//! solver is sufficient.

use ndarray::{Array1, Array2, Axis};

const JACOBI_MAX_SWEEPS: usize = 100;
const JACOBI_TOLERANCE: f64 = 1e-14;
/// Eigenvalues below this fraction of the largest are treated as zero.
const RANK_TOLERANCE: f64 = 1e-10;

/// Eigendecomposition of a symmetric matrix.
///
/// Returns eigenvalues in descending order and the matching unit eigenvectors
/// as columns.
pub fn symmetric_eigen(matrix: &Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let n = matrix.nrows();
    debug_assert_eq!(n, matrix.ncols());

    let mut a = matrix.clone();
    let mut v = Array2::<f64>::eye(n);

    for _ in 0..JACOBI_MAX_SWEEPS {
        let mut off = 0.0;
        let mut total = 0.0;
        for i in 0..n {
            for j in 0..n {
                let sq = a[[i, j]] * a[[i, j]];
                total += sq;
                if i != j {
                    off += sq;
                }
            }
        }
        if off <= JACOBI_TOLERANCE * total || off == 0.0 {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[[p, q]];
                if apq == 0.0 {
                    continue;
                }
                let app = a[[p, p]];
                let aqq = a[[q, q]];
                let theta = (aqq - app) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[[k, p]];
                    let akq = a[[k, q]];
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[[p, k]];
                    let aqk = a[[q, k]];
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| a[[j, j]].total_cmp(&a[[i, i]]));

    let values = Array1::from_iter(order.iter().map(|&i| a[[i, i]]));
    let mut vectors = Array2::<f64>::zeros((n, n));
    for (dst, &src) in order.iter().enumerate() {
        vectors.column_mut(dst).assign(&v.column(src));
    }

    (values, vectors)
}

/// Mean of the rows of `data`.
pub fn row_mean(data: &Array2<f64>) -> Array1<f64> {
    data.mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(data.ncols()))
}

/// Principal component basis of row-major samples, relative to `mean`.
///
/// Returns a d×k matrix of unit-norm components (k ≤ `max_components`),
/// ordered by decreasing variance. Directions with no variance are dropped.
pub fn pca(data: &Array2<f64>, mean: &Array1<f64>, max_components: usize) -> Array2<f64> {
    let (n, d) = data.dim();
    let centered = data - mean;

    let mut components: Vec<Array1<f64>> = Vec::new();

    if n <= d {
        // Gram trick: eigenvectors of X·Xᵀ map to covariance eigenvectors via Xᵀ.
        let gram = centered.dot(&centered.t());
        let (values, vectors) = symmetric_eigen(&gram);
        let largest = values.get(0).copied().unwrap_or(0.0);
        for (i, &value) in values.iter().enumerate() {
            if components.len() >= max_components || value <= largest * RANK_TOLERANCE || value <= 0.0 {
                break;
            }
            let u = centered.t().dot(&vectors.column(i));
            let norm = u.dot(&u).sqrt();
            if norm > 0.0 {
                components.push(u / norm);
            }
        }
    } else {
        let covariance = centered.t().dot(&centered);
        let (values, vectors) = symmetric_eigen(&covariance);
        let largest = values.get(0).copied().unwrap_or(0.0);
        for (i, &value) in values.iter().enumerate() {
            if components.len() >= max_components || value <= largest * RANK_TOLERANCE || value <= 0.0 {
                break;
            }
            components.push(vectors.column(i).to_owned());
        }
    }

    let mut basis = Array2::<f64>::zeros((d, components.len()));
    for (j, component) in components.iter().enumerate() {
        basis.column_mut(j).assign(component);
    }
    basis
}

/// Inverse square root of a symmetric positive semi-definite matrix,
/// regularised by adding `ridge` to the diagonal.
pub fn inverse_sqrt(matrix: &Array2<f64>, ridge: f64) -> Array2<f64> {
    let n = matrix.nrows();
    let regularised = matrix + &(Array2::<f64>::eye(n) * ridge);
    let (values, vectors) = symmetric_eigen(&regularised);
    let scale = values.mapv(|v| if v > 0.0 { 1.0 / v.sqrt() } else { 0.0 });
    let scaled = &vectors * &scale;
    scaled.dot(&vectors.t())
}

/// Euclidean distance between two vectors.
pub fn euclidean(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn reconstruct(values: &Array1<f64>, vectors: &Array2<f64>) -> Array2<f64> {
        let scaled = vectors * values;
        scaled.dot(&vectors.t())
    }

    #[test]
    fn test_eigen_diagonal() {
        let m = array![[1.0, 0.0, 0.0], [0.0, 5.0, 0.0], [0.0, 0.0, 3.0]];
        let (values, _) = symmetric_eigen(&m);
        assert_eq!(values.to_vec(), vec![5.0, 3.0, 1.0]);
    }

    #[test]
    fn test_eigen_reconstructs_matrix() {
        let m = array![[4.0, 1.0, 2.0], [1.0, 3.0, 0.5], [2.0, 0.5, 6.0]];
        let (values, vectors) = symmetric_eigen(&m);
        let r = reconstruct(&values, &vectors);
        for (a, b) in m.iter().zip(r.iter()) {
            assert!((a - b).abs() < 1e-9, "{a} vs {b}");
        }
        // Orthonormal columns
        let gram = vectors.t().dot(&vectors);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((gram[[i, j]] - expected).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_pca_finds_dominant_direction() {
        // Points along the (1, 1) diagonal with tiny noise on the other axis.
        let data = array![[0.0, 0.0], [1.0, 1.0], [2.0, 2.01], [3.0, 2.99]];
        let mean = row_mean(&data);
        let basis = pca(&data, &mean, 1);
        assert_eq!(basis.dim(), (2, 1));
        let c = basis.column(0);
        assert!((c[0].abs() - c[1].abs()).abs() < 0.01);
    }

    #[test]
    fn test_pca_drops_null_directions() {
        // Two distinct points repeated: rank one after centering.
        let data = array![[1.0, 2.0, 3.0], [1.0, 2.0, 3.0], [5.0, 0.0, 1.0], [5.0, 0.0, 1.0]];
        let mean = row_mean(&data);
        let basis = pca(&data, &mean, 4);
        assert_eq!(basis.ncols(), 1);
        let norm = basis.column(0).dot(&basis.column(0));
        assert!((norm - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_pca_of_constant_data_is_empty() {
        let data = Array2::from_elem((3, 5), 7.0);
        let basis = pca(&data, &row_mean(&data), 3);
        assert_eq!(basis.dim(), (5, 0));
    }

    #[test]
    fn test_inverse_sqrt() {
        let m = array![[4.0, 0.0], [0.0, 9.0]];
        let r = inverse_sqrt(&m, 0.0);
        assert!((r[[0, 0]] - 0.5).abs() < 1e-12);
        assert!((r[[1, 1]] - 1.0 / 3.0).abs() < 1e-12);
        assert!(r[[0, 1]].abs() < 1e-12);
    }

    #[test]
    fn test_euclidean() {
        assert_eq!(euclidean(&array![0.0, 3.0], &array![4.0, 0.0]), 5.0);
    }
}
