//! 从粒子图中提取纤维轨迹.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::particle::ParticleId;
use super::{GtResult, ParticleGrid};

/// 一条轨迹: 依次经过的点 (扫描仪坐标, 毫米).
///
/// 对于由 `n` 个粒子组成的链, 点依次为起始自由端, `n` 个粒子中心, 末尾自由端.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Track {
    /// 折线顶点.
    pub points: Vec<[f64; 3]>,

    /// 组成该轨迹的粒子个数.
    pub n_particles: usize,

    /// 链首尾相连成环.
    pub closed: bool,
}

impl Track {
    /// 点的个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// 折线总长度.
    pub fn arc_length(&self) -> f64 {
        self.points
            .windows(2)
            .map(|w| {
                let d = [w[1][0] - w[0][0], w[1][1] - w[0][1], w[1][2] - w[0][2]];
                (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt()
            })
            .sum()
    }
}

/// 沿前驱/后继连接遍历全部粒子链, 输出至少包含 `min_particles` 个粒子的轨迹.
///
/// 遍历期间用粒子的 `visited` 标记认领已输出的粒子, 返回前全部清除.
pub fn export_tracks(grid: &mut ParticleGrid, min_particles: usize) -> GtResult<Vec<Track>> {
    let ids: Vec<ParticleId> = grid.iter().map(|(id, _)| id).collect();
    let mut tracks = Vec::new();
    let res = ids.into_iter().try_for_each(|id| -> GtResult<()> {
        if grid.particle(id)?.is_visited() {
            return Ok(());
        }
        let track = claim_chain(grid, id)?;
        if track.n_particles >= min_particles {
            tracks.push(track);
        }
        Ok(())
    });
    grid.pool_mut().reset_visited();
    res?;

    log::debug!(
        "Exported {} tracks from {} particles",
        tracks.len(),
        grid.len()
    );
    Ok(tracks)
}

/// 找到 `id` 所在链的起点, 再沿链正向遍历并标记.
fn claim_chain(grid: &mut ParticleGrid, id: ParticleId) -> GtResult<Track> {
    // 反向走到自由端. 若回到 `id` 则为环.
    let (mut cur, mut free) = (id, -1);
    let mut closed = false;
    for _ in 0..grid.len() {
        match grid.partner(cur, free) {
            None => break,
            Some((q, _)) if q == id => {
                (cur, free, closed) = (id, -1, true);
                break;
            }
            Some((q, b)) => (cur, free) = (q, -b),
        }
    }

    let first = grid.particle(cur)?;
    let mut points = vec![to_array(&first.end_point(free))];
    let mut n_particles = 0;
    let mut out = -free;
    loop {
        let p = grid.pool_mut().particle_mut(cur)?;
        p.set_visited(true);
        points.push(to_array(p.position()));
        n_particles += 1;

        match grid.partner(cur, out) {
            Some((q, b)) if !grid.particle(q)?.is_visited() => (cur, out) = (q, -b),
            _ => break,
        }
    }
    let last = grid.particle(cur)?;
    points.push(to_array(&last.end_point(out)));

    Ok(Track {
        points,
        n_particles,
        closed,
    })
}

#[inline]
fn to_array(p: &crate::Point) -> [f64; 3] {
    [p.x, p.y, p.z]
}

#[cfg(test)]
mod tests {
    use super::export_tracks;
    use crate::data::VolumeGeometry;
    use crate::gt::{ParticleEnd, ParticleGrid};
    use crate::Point;

    fn grid() -> ParticleGrid {
        ParticleGrid::new(
            &VolumeGeometry::new((10, 10, 10), [1.0; 3], Point::zeros()),
            0.5,
        )
    }

    fn approx(a: [f64; 3], b: [f64; 3]) -> bool {
        a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-9)
    }

    #[test]
    fn test_chain() {
        let mut g = grid();
        let a = g.add(Point::new(2.0, 5.0, 5.0), Point::x()).unwrap();
        let b = g.add(Point::new(3.0, 5.0, 5.0), -Point::x()).unwrap();
        let c = g.add(Point::new(4.0, 5.0, 5.0), Point::x()).unwrap();
        // a(+1) - b(+1), b(-1) - c(-1): b 反向放置.
        g.connect(&ParticleEnd::new(a, 1), &ParticleEnd::new(b, 1)).unwrap();
        g.connect(&ParticleEnd::new(b, -1), &ParticleEnd::new(c, -1)).unwrap();
        let lone = g.add(Point::new(8.0, 8.0, 8.0), Point::z()).unwrap();

        let tracks = export_tracks(&mut g, 2).unwrap();
        assert_eq!(tracks.len(), 1);
        let t = &tracks[0];
        assert_eq!(t.n_particles, 3);
        assert_eq!(t.len(), 5);
        assert!(!t.closed);
        assert!((t.arc_length() - 3.0).abs() < 1e-9);

        let ends = [t.points[0], t.points[4]];
        assert!(ends.iter().any(|p| approx(*p, [1.5, 5.0, 5.0])));
        assert!(ends.iter().any(|p| approx(*p, [4.5, 5.0, 5.0])));
        assert!(approx(t.points[2], [3.0, 5.0, 5.0]));

        // 标记已清除, 单粒子轨迹在阈值为 1 时输出.
        assert!(g.iter().all(|(_, p)| !p.is_visited()));
        let tracks = export_tracks(&mut g, 1).unwrap();
        assert_eq!(tracks.len(), 2);
        assert!(tracks.iter().any(|t| t.n_particles == 1 && t.len() == 3));
        assert!(g.get(lone).is_some());
    }

    #[test]
    fn test_cycle() {
        let mut g = grid();
        let centres = [
            Point::new(5.0, 4.0, 5.0),
            Point::new(6.0, 5.0, 5.0),
            Point::new(5.0, 6.0, 5.0),
            Point::new(4.0, 5.0, 5.0),
        ];
        let ids: Vec<_> = centres
            .iter()
            .map(|c| g.add(*c, Point::x()).unwrap())
            .collect();
        for i in 0..4 {
            let j = (i + 1) % 4;
            g.connect(&ParticleEnd::new(ids[i], 1), &ParticleEnd::new(ids[j], -1))
                .unwrap();
        }
        g.check_consistency().unwrap();

        let tracks = export_tracks(&mut g, 2).unwrap();
        assert_eq!(tracks.len(), 1);
        assert!(tracks[0].closed);
        assert_eq!(tracks[0].n_particles, 4);
        assert_eq!(tracks[0].len(), 6);
        assert!(g.iter().all(|(_, p)| !p.is_visited()));
    }
}
