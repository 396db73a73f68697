//! 合成体模: 两束正交交叉的纤维.
//!
//! 白质响应由 `Y(g) * k_l` 给出, 与真实的单纤维响应形状相近.

use dwi_berry::gt::Properties;
use dwi_berry::{sh, DwiImage, MaskImage, Point};
use ndarray::{Array1, Array2, Array3, Array4};

/// 体模的球谐阶数.
pub const LMAX: u32 = 4;

/// 各阶响应系数 `k_0, k_2, k_4`.
const RESPONSE: [f64; 3] = [1.0, -0.6, 0.25];

/// 自由水信号强度.
const ISO_SIGNAL: f32 = 0.2;

/// 半球上近似均匀分布的 `n` 个梯度方向 (Fibonacci 格点).
pub fn gradients(n: usize) -> Vec<Point> {
    let golden = std::f64::consts::PI * (3.0 - 5f64.sqrt());
    (0..n)
        .map(|i| {
            let z = 1.0 - (i as f64 + 0.5) / n as f64;
            let r = (1.0 - z * z).sqrt();
            let phi = golden * i as f64;
            Point::new(r * phi.cos(), r * phi.sin(), z)
        })
        .collect()
}

/// 白质响应矩阵, 形状 `(n_dwi, n_sh)`.
pub fn response(grads: &[Point]) -> Array2<f32> {
    let mut r = Array2::zeros((grads.len(), sh::n_for_lmax(LMAX)));
    for (i, g) in grads.iter().enumerate() {
        let y = sh::delta_f64([g.x, g.y, g.z], LMAX);
        for l in (0..=LMAX).step_by(2) {
            for m in -(l as i32)..=l as i32 {
                let j = sh::index(l, m);
                r[(i, j)] = (y[j] * RESPONSE[l as usize / 2]) as f32;
            }
        }
    }
    r
}

/// `dims` 个体素, 体素边长 `spacing` 毫米. 沿 x 的纤维束占据 `y` 方向中间三分之一,
/// 沿 y 的纤维束占据 `x` 方向中间三分之一, 两者在中心交叉.
///
/// 返回图像, 全掩膜以及填好响应的参数.
pub fn crossing(dims: (usize, usize, usize), spacing: f64) -> (DwiImage, MaskImage, Properties) {
    let grads = gradients(30);
    let resp_wm = response(&grads);
    let fibre = |d: Point| {
        let c = Array1::from(sh::delta_f64([d.x, d.y, d.z], LMAX)).mapv(|v| v as f32);
        resp_wm.dot(&c)
    };
    let (sx, sy) = (fibre(Point::x()), fibre(Point::y()));

    let (nx, ny, nz) = dims;
    let in_band = |i: usize, n: usize| i >= n / 3 && i < n - n / 3;
    let mut data = Array4::zeros((nx, ny, nz, grads.len()));
    for ((x, y, _, k), v) in data.indexed_iter_mut() {
        let mut s = ISO_SIGNAL;
        if in_band(y, ny) {
            s += sx[k];
        }
        if in_band(x, nx) {
            s += sy[k];
        }
        *v = s;
    }

    let props = Properties {
        length: spacing / 2.0,
        lmax: LMAX,
        resp_iso: vec![Array1::ones(grads.len())],
        resp_wm,
        ..Default::default()
    };
    let origin = Point::zeros();
    let dwi = DwiImage::fake(data, [spacing; 3], origin);
    let mask = MaskImage::fake(Array3::from_elem(dims, true), [spacing; 3], origin);
    (dwi, mask, props)
}
