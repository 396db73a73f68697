//! 测试用合成数据.

use ndarray::{Array1, Array2, Array3, Array4, Axis};

use super::Properties;
use crate::data::{DwiImage, MaskImage};
use crate::{sh, Idx3d, Point};

pub(crate) const LMAX: u32 = 2;

/// 9 个梯度方向: 3 个坐标轴加 6 个面对角线.
pub(crate) fn gradients() -> Vec<Point> {
    vec![
        Point::x(),
        Point::y(),
        Point::z(),
        Point::new(1.0, 1.0, 0.0).normalize(),
        Point::new(0.0, 1.0, 1.0).normalize(),
        Point::new(1.0, 0.0, 1.0).normalize(),
        Point::new(1.0, -1.0, 0.0).normalize(),
        Point::new(0.0, 1.0, -1.0).normalize(),
        Point::new(-1.0, 0.0, 1.0).normalize(),
    ]
}

/// 沿梯度 `g` 的白质响应为 `Y(g) * k_l`.
pub(crate) fn response() -> Array2<f32> {
    let k = [1.0, -0.5];
    let g = gradients();
    let mut r = Array2::zeros((g.len(), sh::n_for_lmax(LMAX)));
    for (i, d) in g.iter().enumerate() {
        let y = sh::delta_f64([d.x, d.y, d.z], LMAX);
        for l in (0..=LMAX).step_by(2) {
            for m in -(l as i32)..=l as i32 {
                let j = sh::index(l, m);
                r[(i, j)] = (y[j] * k[l as usize / 2]) as f32;
            }
        }
    }
    r
}

/// `dims` 个 1 mm 体素, 每个体素的信号都是 `scale` 根沿 `dir` 的纤维的预测信号.
/// 掩膜覆盖全部体素. 参数 `weight = 1`, `ppot = 0`.
pub(crate) fn fibre_phantom(
    dims: Idx3d,
    dir: Point,
    scale: f32,
) -> (DwiImage, MaskImage, Properties) {
    let props = Properties {
        lmax: LMAX,
        weight: 1.0,
        ppot: 0.0,
        resp_wm: response(),
        resp_iso: vec![Array1::ones(gradients().len())],
        ..Default::default()
    };
    let fibre =
        Array1::from(sh::delta_f64([dir.x, dir.y, dir.z], LMAX)).mapv(|v| v as f32 * scale);
    let sig = props.resp_wm.dot(&fibre);
    let mut data = Array4::zeros((dims.0, dims.1, dims.2, sig.len()));
    for mut s in data.lanes_mut(Axis(3)) {
        s.assign(&sig);
    }
    let dwi = DwiImage::fake(data, [1.0; 3], Point::zeros());
    let mask = MaskImage::fake(Array3::from_elem(dims, true), [1.0; 3], Point::zeros());
    (dwi, mask, props)
}
