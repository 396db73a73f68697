use std::ops::Index;
use std::path::Path;

use ndarray::{Array3, Array4, ArrayView1, ArrayView3, ArrayView4, Ix3, Ix4};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::gt::GtResult;
use crate::{Idx3d, Point};

/// `NiftiHeader` 是栈上大对象, 移动该对象的开销很可观.
/// 因此我们将其分配到堆上.
type BoxedHeader = Box<NiftiHeader>;

/// 体数据的空间几何: 体素个数, 体素分辨率 (毫米) 以及第一个体素中心的扫描仪坐标.
///
/// 目前只考虑轴对齐的仿射变换, 忽略旋转与剪切.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct VolumeGeometry {
    dims: Idx3d,
    spacing: [f64; 3],
    origin: Point,
}

impl VolumeGeometry {
    /// 创建几何信息. `spacing` 的每个分量必须为正, 否则 panic.
    pub fn new(dims: Idx3d, spacing: [f64; 3], origin: Point) -> Self {
        assert!(spacing.iter().all(|s| s.is_finite() && *s > 0.0));
        Self {
            dims,
            spacing,
            origin,
        }
    }

    /// 从 nifti header 提取几何信息. 优先使用 sform, 其次 qform 偏移.
    pub fn from_header(h: &NiftiHeader) -> Self {
        let [_, x, y, z, ..] = h.dim;
        let [_, sx, sy, sz, ..] = h.pixdim;
        let origin = if h.sform_code > 0 {
            Point::new(
                f64::from(h.srow_x[3]),
                f64::from(h.srow_y[3]),
                f64::from(h.srow_z[3]),
            )
        } else {
            Point::new(
                f64::from(h.quatern_x),
                f64::from(h.quatern_y),
                f64::from(h.quatern_z),
            )
        };
        // pixdim 可能为 0 (未设置), 此时按 1 毫米处理.
        let fix = |s: f32| if s.is_normal() { f64::from(s.abs()) } else { 1.0 };
        Self::new(
            (x as usize, y as usize, z as usize),
            [fix(sx), fix(sy), fix(sz)],
            origin,
        )
    }

    /// 体素个数 `(x, y, z)`.
    #[inline]
    pub fn dims(&self) -> Idx3d {
        self.dims
    }

    /// 体素分辨率 (毫米).
    #[inline]
    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    /// 体素 `(0, 0, 0)` 中心的扫描仪坐标.
    #[inline]
    pub fn origin(&self) -> &Point {
        &self.origin
    }

    /// 单个体素的体积, 以立方毫米为单位.
    #[inline]
    pub fn voxel_volume(&self) -> f64 {
        self.spacing.iter().product()
    }

    /// 扫描仪坐标 -> 连续体素坐标. 体素中心位于整数坐标上.
    #[inline]
    pub fn scanner_to_voxel(&self, p: &Point) -> Point {
        let d = p - self.origin;
        Point::new(
            d.x / self.spacing[0],
            d.y / self.spacing[1],
            d.z / self.spacing[2],
        )
    }

    /// 体素中心的扫描仪坐标.
    #[inline]
    pub fn voxel_to_scanner(&self, (x, y, z): Idx3d) -> Point {
        self.origin
            + Point::new(
                x as f64 * self.spacing[0],
                y as f64 * self.spacing[1],
                z as f64 * self.spacing[2],
            )
    }

    /// 包含扫描仪坐标 `p` 的体素. 越界时返回 `None`.
    pub fn voxel_of(&self, p: &Point) -> Option<Idx3d> {
        let v = self.scanner_to_voxel(p);
        let (x, y, z) = self.dims;
        let idx = |c: f64, n: usize| {
            let r = c.round();
            (r >= 0.0 && (r as usize) < n).then_some(r as usize)
        };
        Some((idx(v.x, x)?, idx(v.y, y)?, idx(v.z, z)?))
    }

    /// 体数据包围盒的下角 (扫描仪坐标).
    #[inline]
    pub fn lower_corner(&self) -> Point {
        self.origin - Point::from(self.spacing) * 0.5
    }

    /// 体数据包围盒的边长 (毫米).
    #[inline]
    pub fn extent(&self) -> Point {
        let (x, y, z) = self.dims;
        Point::new(
            x as f64 * self.spacing[0],
            y as f64 * self.spacing[1],
            z as f64 * self.spacing[2],
        )
    }
}

/// nii 文件 header 的共用属性.
pub trait NiftiHeaderAttr {
    /// 获取 header 部分.
    fn header(&self) -> &NiftiHeader;

    /// 获取空间几何信息.
    #[inline]
    fn geometry(&self) -> VolumeGeometry {
        VolumeGeometry::from_header(self.header())
    }

    /// 获取单个体素的体积, 以立方毫米为单位.
    #[inline]
    fn voxel(&self) -> f64 {
        self.geometry().voxel_volume()
    }
}

/// 按照给定形状与几何信息拼出一个最小可用的 header.
fn fake_header(dim: &[usize], spacing: [f64; 3], origin: &Point) -> BoxedHeader {
    let mut header = Box::<NiftiHeader>::default();
    header.dim[0] = dim.len() as u16;
    for (d, n) in header.dim.iter_mut().skip(1).zip(dim) {
        *d = *n as u16;
    }
    for (d, s) in header.pixdim.iter_mut().skip(1).zip(spacing) {
        *d = s as f32;
    }
    header.sform_code = 0;
    (header.quatern_x, header.quatern_y, header.quatern_z) =
        (origin.x as f32, origin.y as f32, origin.z as f32);
    header.intent_name[..4].copy_from_slice(b"fake");
    header
}

/// nii 格式 4D 扩散加权图像. 信号以 `f32` 保存, 按照 `[x, y, z, volume]` 访问.
#[derive(Debug, Clone)]
pub struct DwiImage {
    header: BoxedHeader,
    data: Array4<f32>,
}

impl NiftiHeaderAttr for DwiImage {
    #[inline]
    fn header(&self) -> &NiftiHeader {
        &self.header
    }
}

impl DwiImage {
    /// 打开 nii 文件格式的 4D 扩散加权图像. 若文件不是 4D 的, 返回 `Err`.
    pub fn open<P: AsRef<Path>>(path: P) -> GtResult<Self> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let header = Box::new(obj.header().clone());
        let data = obj
            .into_volume()
            .into_ndarray::<f32>()?
            .into_dimensionality::<Ix4>()?;

        // nifti 数据按 Fortran 顺序排列. 转换后同一体素的信号在内存中连续.
        let data = data.as_standard_layout().into_owned();
        Ok(Self { header, data })
    }

    /// 根据裸数据和几何信息直接创建 `DwiImage`. 主要用于合成体模与测试.
    pub fn fake(data: Array4<f32>, spacing: [f64; 3], origin: Point) -> Self {
        let header = fake_header(data.shape(), spacing, &origin);
        Self { header, data }
    }

    /// 判断该结构是否是由 [`Self::fake`] 手动拼接的.
    pub fn is_faked(&self) -> bool {
        self.header.intent_name.starts_with(b"fake")
    }

    /// 空间形状 `(x, y, z)`.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        let s = self.data.shape();
        (s[0], s[1], s[2])
    }

    /// 每个体素的 DWI 采样个数.
    #[inline]
    pub fn len_volumes(&self) -> usize {
        self.data.shape()[3]
    }

    /// 体素 `pos` 处的信号.
    ///
    /// 当 `pos` 越界时 panic.
    #[inline]
    pub fn signal(&self, (x, y, z): Idx3d) -> ArrayView1<'_, f32> {
        self.data.slice(ndarray::s![x, y, z, ..])
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }
}

/// nii 格式 3D 掩膜. 非零体素为前景.
#[derive(Debug, Clone)]
pub struct MaskImage {
    header: BoxedHeader,
    data: Array3<bool>,
}

impl NiftiHeaderAttr for MaskImage {
    #[inline]
    fn header(&self) -> &NiftiHeader {
        &self.header
    }
}

impl Index<Idx3d> for MaskImage {
    type Output = bool;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl MaskImage {
    /// 打开 nii 文件格式的 3D 掩膜.
    pub fn open<P: AsRef<Path>>(path: P) -> GtResult<Self> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let header = Box::new(obj.header().clone());
        let data = obj
            .into_volume()
            .into_ndarray::<u8>()?
            .into_dimensionality::<Ix3>()?
            .map(|v| *v != 0);
        Ok(Self { header, data })
    }

    /// 根据裸数据和几何信息直接创建 `MaskImage`.
    pub fn fake(data: Array3<bool>, spacing: [f64; 3], origin: Point) -> Self {
        let header = fake_header(data.shape(), spacing, &origin);
        Self { header, data }
    }

    /// 覆盖整个 `dwi` 空间范围的全前景掩膜.
    pub fn full_like(dwi: &DwiImage) -> Self {
        let g = dwi.geometry();
        Self::fake(Array3::from_elem(dwi.shape(), true), g.spacing(), *g.origin())
    }

    /// 空间形状 `(x, y, z)`.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.data.dim()
    }

    /// 获取体素值. 越界时返回 `None`.
    #[inline]
    pub fn get(&self, pos: Idx3d) -> Option<bool> {
        self.data.get(pos).copied()
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView3<'_, bool> {
        self.data.view()
    }

    /// 前景体素个数.
    #[inline]
    pub fn count(&self) -> usize {
        self.data.iter().filter(|v| **v).count()
    }

    /// 收集所有前景体素的下标. 结果按行优先存储.
    pub fn foreground_pos(&self) -> Vec<Idx3d> {
        self.data
            .indexed_iter()
            .filter_map(|(pos, v)| v.then_some(pos))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{DwiImage, MaskImage, NiftiHeaderAttr, VolumeGeometry};
    use crate::Point;
    use ndarray::{Array3, Array4};

    fn f64_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_geometry_round_trip_voxel_center() {
        let g = VolumeGeometry::new((4, 5, 6), [2.0, 2.0, 2.5], Point::new(-3.0, 1.0, 0.5));
        let p = g.voxel_to_scanner((1, 2, 3));
        assert_eq!(g.voxel_of(&p), Some((1, 2, 3)));
        assert!(f64_eq(g.voxel_volume(), 10.0));

        // 体素边界外侧.
        assert_eq!(g.voxel_of(&Point::new(-5.0, 1.0, 0.5)), None);
        assert_eq!(g.voxel_of(&g.voxel_to_scanner((3, 4, 5))), Some((3, 4, 5)));
        let corner = g.lower_corner();
        assert!(f64_eq(corner.x, -4.0));
        assert!(f64_eq(g.extent().z, 15.0));
    }

    #[test]
    fn test_fake_images_carry_geometry() {
        let dwi = DwiImage::fake(
            Array4::zeros((3, 4, 5, 7)),
            [1.5, 1.5, 2.0],
            Point::new(1.0, 2.0, 3.0),
        );
        assert!(dwi.is_faked());
        assert_eq!(dwi.shape(), (3, 4, 5));
        assert_eq!(dwi.len_volumes(), 7);
        let g = dwi.geometry();
        assert_eq!(g.dims(), (3, 4, 5));
        assert!(f64_eq(g.spacing()[2], 2.0));
        assert!(f64_eq(g.origin().y, 2.0));

        let mut m = Array3::from_elem((3, 4, 5), false);
        m[(1, 1, 1)] = true;
        m[(2, 3, 4)] = true;
        let mask = MaskImage::fake(m, g.spacing(), *g.origin());
        assert_eq!(mask.count(), 2);
        assert_eq!(mask.foreground_pos(), vec![(1, 1, 1), (2, 3, 4)]);
        assert!(mask[(2, 3, 4)]);
        assert_eq!(mask.get((9, 9, 9)), None);
        assert_eq!(MaskImage::full_like(&dwi).count(), 60);
    }
}
