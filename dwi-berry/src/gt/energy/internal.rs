//! 内部能量: 奖励共线, 首尾相接的粒子链, 惩罚折角与断口.

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::EnergyComputer;
use crate::gt::particle::{ParticleEnd, ParticleId};
use crate::gt::properties::Properties;
use crate::gt::stats::Stats;
use crate::gt::{GtResult, GtState, ParticleGrid};
use crate::Point;

/// 内部能量计算器.
///
/// 一条连接的能量为两个连接端点到两粒子中心连线中点的距离平方和,
/// 以 `L^2` 归一化, 再减去连接势能 `cpot`.
#[derive(Debug)]
pub struct InternalEnergyComputer {
    stats: Arc<Stats>,
    length: f64,
    cpot: f64,
    rng: ChaCha8Rng,
    neighbourhood: Vec<ParticleEnd>,
    de: f64,
}

impl InternalEnergyComputer {
    /// 创建计算器. `seed` 决定连接提议的随机选择.
    pub fn new(stats: Arc<Stats>, props: &Properties, seed: u64) -> Self {
        Self {
            stats,
            length: props.length,
            cpot: props.cpot,
            rng: ChaCha8Rng::seed_from_u64(seed),
            neighbourhood: Vec::with_capacity(16),
            de: 0.0,
        }
    }

    /// 连接能量. `ep1`, `ep2` 分别是两个粒子参与连接的端点.
    ///
    /// 对两个参数对称.
    pub fn calc_energy(&self, pos1: &Point, ep1: &Point, pos2: &Point, ep2: &Point) -> f64 {
        let mid = (pos1 + pos2) * 0.5;
        ((ep1 - mid).norm_squared() + (ep2 - mid).norm_squared()) / (self.length * self.length)
            - self.cpot
    }

    /// 粒子 `par` 在 `alpha` 端上现有连接的能量. 无连接时为 0.
    fn link_energy(&self, grid: &ParticleGrid, par: ParticleId, alpha: i32) -> GtResult<f64> {
        let Some((q, beta)) = grid.partner(par, alpha) else {
            return Ok(0.0);
        };
        let p = grid.particle(par)?;
        let q = grid.particle(q)?;
        Ok(self.calc_energy(
            p.position(),
            &p.end_point(alpha),
            q.position(),
            &q.end_point(beta),
        ))
    }

    /// 收集 `pe1` 端点附近可供连接的自由端点, 以及 "不连接" 选项和当前连接.
    ///
    /// 候选端点 (包括当前连接的端点) 与 `pe1` 端点的距离必须小于 `L`.
    /// 每个候选的 `e_conn` 为连接后的能量, `p_suc` 为按 Boltzmann 权重归一化的提议概率.
    /// 返回当前状态 (现有连接或不连接) 在候选列表中的下标.
    /// 若现有连接已被拉长到 `L` 之外, 返回 `None`: 此时任何改动都无法由逆提议恢复.
    fn scan_neighbourhood(
        &mut self,
        grid: &ParticleGrid,
        pe1: &ParticleEnd,
    ) -> GtResult<Option<usize>> {
        self.neighbourhood.clear();
        self.neighbourhood.push(ParticleEnd::none());

        let Some(par) = pe1.par else {
            return Ok(Some(0));
        };
        let alpha = pe1.alpha;
        let p = grid.particle(par)?;
        let ep = p.end_point(alpha);
        let other = p.link(-alpha);
        let current = grid.partner(par, alpha);
        let mut current_slot = None;

        let (l, cpot) = (self.length, self.cpot);
        let candidates = &mut self.neighbourhood;
        grid.for_each_within(&ep, 2.0 * l, |id, q| {
            if id == par || Some(id) == other {
                return;
            }
            for beta in [-1, 1] {
                let is_current = current == Some((id, beta));
                let epq = q.end_point(beta);
                if (is_current || q.link(beta).is_none()) && (epq - ep).norm() < l {
                    let mid = (p.position() + q.position()) * 0.5;
                    let e = ((ep - mid).norm_squared() + (epq - mid).norm_squared()) / (l * l)
                        - cpot;
                    if is_current {
                        current_slot = Some(candidates.len());
                    }
                    candidates.push(ParticleEnd {
                        par: Some(id),
                        alpha: beta,
                        p_suc: 0.0,
                        e_conn: e,
                    });
                }
            }
        });

        if current.is_some() && current_slot.is_none() {
            return Ok(None);
        }
        let current_slot = current_slot.unwrap_or(0);

        let t = self.stats.tint();
        let e_min = self
            .neighbourhood
            .iter()
            .map(|c| c.e_conn)
            .fold(f64::INFINITY, f64::min);
        let mut z = 0.0;
        for c in self.neighbourhood.iter_mut() {
            c.p_suc = (-(c.e_conn - e_min) / t).exp();
            z += c.p_suc;
        }
        for c in self.neighbourhood.iter_mut() {
            c.p_suc /= z;
        }
        Ok(Some(current_slot))
    }

    /// 按提议概率随机选取一个候选.
    fn pick_neighbour(&mut self) -> ParticleEnd {
        let u: f64 = self.rng.gen();
        let mut acc = 0.0;
        for c in &self.neighbourhood {
            acc += c.p_suc;
            if u < acc {
                return *c;
            }
        }
        // 舍入误差.
        self.neighbourhood
            .last()
            .copied()
            .unwrap_or_else(ParticleEnd::none)
    }
}

impl EnergyComputer for InternalEnergyComputer {
    fn stage_add(&mut self, _state: &GtState, _pos: &Point, _dir: &Point) -> GtResult<f64> {
        // 新粒子没有连接.
        self.de = 0.0;
        Ok(0.0)
    }

    fn stage_shift(
        &mut self,
        state: &GtState,
        par: ParticleId,
        pos: &Point,
        dir: &Point,
    ) -> GtResult<f64> {
        let grid = &state.grid;
        let mut de = 0.0;
        for alpha in [-1, 1] {
            let Some((q, beta)) = grid.partner(par, alpha) else {
                continue;
            };
            let q = grid.particle(q)?;
            let ep = pos + dir * (f64::from(alpha) * self.length);
            de -= self.link_energy(grid, par, alpha)?;
            de += self.calc_energy(pos, &ep, q.position(), &q.end_point(beta));
        }
        self.de = de;
        Ok(de / self.stats.tint())
    }

    fn stage_remove(&mut self, state: &GtState, par: ParticleId) -> GtResult<f64> {
        let grid = &state.grid;
        grid.particle(par)?;
        let de = -(self.link_energy(grid, par, -1)? + self.link_energy(grid, par, 1)?);
        self.de = de;
        Ok(de / self.stats.tint())
    }

    fn stage_connect(
        &mut self,
        state: &GtState,
        pe1: &mut ParticleEnd,
        pe2: &mut ParticleEnd,
    ) -> GtResult<f64> {
        let Some(current) = self.scan_neighbourhood(&state.grid, pe1)? else {
            // 保持被拉长的连接不变, 调用方视为拒绝.
            let current = pe1.par.and_then(|par| state.grid.partner(par, pe1.alpha));
            if let Some((q, beta)) = current {
                *pe2 = ParticleEnd::new(q, beta);
            }
            pe1.p_suc = 1.0;
            self.de = 0.0;
            return Ok(0.0);
        };
        let chosen = self.pick_neighbour();
        let now = self.neighbourhood[current];

        pe1.p_suc = now.p_suc;
        pe1.e_conn = now.e_conn;
        *pe2 = chosen;

        self.de = if chosen.par == now.par && chosen.alpha == now.alpha {
            0.0
        } else {
            chosen.e_conn - now.e_conn
        };
        Ok(self.de / self.stats.tint())
    }

    fn accept_changes(&mut self, _state: &mut GtState) {
        self.stats.inc_eint_tot(self.de);
        self.de = 0.0;
    }

    fn clear_changes(&mut self) {
        self.de = 0.0;
    }

    fn eval(&self, state: &GtState) -> f64 {
        let grid = &state.grid;
        let mut e = 0.0;
        for (id, _) in grid.iter() {
            for alpha in [-1, 1] {
                // 每条连接只计一次.
                if let Some((q, beta)) = grid.partner(id, alpha) {
                    if (id, alpha) < (q, beta) {
                        e += self.link_energy(grid, id, alpha).unwrap_or(0.0);
                    }
                }
            }
        }
        e
    }
}

#[cfg(test)]
mod tests {
    use super::InternalEnergyComputer;
    use crate::data::VolumeGeometry;
    use crate::gt::energy::EnergyComputer;
    use crate::gt::particle::ParticleEnd;
    use crate::gt::{GtState, ParticleGrid, Properties, Stats};
    use crate::Point;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::sync::Arc;

    const L: f64 = 1.0;

    fn f64_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-10
    }

    fn computer(tint: f64) -> InternalEnergyComputer {
        let stats = Arc::new(Stats::new(tint, tint, 100).unwrap());
        InternalEnergyComputer::new(stats, &Properties::default(), 11)
    }

    fn state() -> GtState {
        // 20 x 20 x 20 mm.
        let geo = VolumeGeometry::new((10, 10, 10), [2.0; 3], Point::new(1.0, 1.0, 1.0));
        GtState::new(ParticleGrid::new(&geo, L))
    }

    fn random_unit<R: Rng>(rng: &mut R) -> Point {
        loop {
            let v = Point::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            );
            if let Some(v) = v.try_normalize(1e-3) {
                return v;
            }
        }
    }

    #[test]
    fn test_energy_symmetry() {
        let c = computer(1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        for _ in 0..1000 {
            let pos1 = random_unit(&mut rng) * rng.gen_range(0.0..5.0);
            let pos2 = random_unit(&mut rng) * rng.gen_range(0.0..5.0);
            let ep1 = pos1 + random_unit(&mut rng) * L;
            let ep2 = pos2 + random_unit(&mut rng) * L;
            let a = c.calc_energy(&pos1, &ep1, &pos2, &ep2);
            let b = c.calc_energy(&pos2, &ep2, &pos1, &ep1);
            assert!(f64_eq(a, b));
        }
    }

    /// 共线相接的两个粒子能量最低, 大幅垂直错开则远高于此.
    #[test]
    fn test_collinear_is_favourable() {
        let c = computer(1.0);
        let cpot = Properties::default().cpot;
        let a = Point::zeros();
        let z = Point::z();

        let abut = Point::new(0.0, 0.0, 2.0 * L);
        let e_abut = c.calc_energy(&a, &(a + z * L), &abut, &(abut - z * L));
        assert!(f64_eq(e_abut, -cpot));

        let near = Point::new(0.0, 0.0, L);
        let e_near = c.calc_energy(&a, &(a + z * L), &near, &(near - z * L));

        let far = Point::new(10.0 * L, 0.0, 0.0);
        let e_far = c.calc_energy(&a, &(a + z * L), &far, &(far - z * L));

        assert!(e_abut <= e_near);
        assert!(e_near < e_far);
        assert!(e_far > 0.0);
    }

    #[test]
    fn test_stage_shift_and_remove() {
        let mut s = state();
        let mut c = computer(0.5);
        let a = s.grid.add(Point::new(5.0, 5.0, 5.0), Point::z()).unwrap();
        let b = s.grid.add(Point::new(5.0, 5.0, 7.0), Point::z()).unwrap();
        s.grid
            .connect(&ParticleEnd::new(a, 1), &ParticleEnd::new(b, -1))
            .unwrap();
        let e0 = c.eval(&s);
        assert!(f64_eq(e0, -1.0));

        // 原地不动: ΔE = 0.
        let d = c
            .stage_shift(&s, b, &Point::new(5.0, 5.0, 7.0), &Point::z())
            .unwrap();
        assert!(f64_eq(d, 0.0));

        // 侧移 1 mm: 能量升高.
        let d = c
            .stage_shift(&s, b, &Point::new(6.0, 5.0, 7.0), &Point::z())
            .unwrap();
        assert!(d > 0.0);
        c.clear_changes();

        // 删除: 失去一条 -cpot 的连接, ΔE / T = 1 / 0.5.
        let d = c.stage_remove(&s, a).unwrap();
        assert!(f64_eq(d, 2.0));

        // 孤立粒子的增删不改变内部能量.
        let lone = s.grid.add(Point::new(15.0, 15.0, 15.0), Point::x()).unwrap();
        assert!(f64_eq(c.stage_remove(&s, lone).unwrap(), 0.0));
        assert!(f64_eq(
            c.stage_add(&s, &Point::new(3.0, 3.0, 3.0), &Point::x())
                .unwrap(),
            0.0
        ));
    }

    #[test]
    fn test_stage_connect_picks_nearby_end() {
        let mut s = state();
        // 温度很低, 几乎必然选择能量最低的候选.
        let mut c = computer(1e-3);
        let a = s.grid.add(Point::new(5.0, 5.0, 5.0), Point::z()).unwrap();
        let b = s.grid.add(Point::new(5.0, 5.0, 7.05), Point::z()).unwrap();
        let _far = s.grid.add(Point::new(15.0, 5.0, 5.0), Point::z()).unwrap();

        let mut pe1 = ParticleEnd::new(a, 1);
        let mut pe2 = ParticleEnd::none();
        let d = c.stage_connect(&s, &mut pe1, &mut pe2).unwrap();
        assert_eq!(pe2.par, Some(b));
        assert_eq!(pe2.alpha, -1);
        assert!(pe2.p_suc > 0.99);
        assert!(pe1.p_suc < 1e-6);
        assert!(d < 0.0);
        assert!(f64_eq(d * 1e-3, pe2.e_conn));

        // 接受并实际连接后, 再次提议基本只会保持现状.
        c.accept_changes(&mut s);
        s.grid.connect(&pe1, &pe2).unwrap();
        let mut pe1 = ParticleEnd::new(a, 1);
        let mut pe2 = ParticleEnd::none();
        let d = c.stage_connect(&s, &mut pe1, &mut pe2).unwrap();
        assert_eq!(pe2.par, Some(b));
        assert!(f64_eq(d, 0.0));
        assert!(pe1.p_suc > 0.99);
    }

    #[test]
    fn test_stage_connect_without_candidates() {
        let mut s = state();
        let mut c = computer(1.0);
        let a = s.grid.add(Point::new(5.0, 5.0, 5.0), Point::z()).unwrap();
        let mut pe1 = ParticleEnd::new(a, -1);
        let mut pe2 = ParticleEnd::new(a, 1);
        let d = c.stage_connect(&s, &mut pe1, &mut pe2).unwrap();
        assert_eq!(pe2.par, None);
        assert_eq!(d, 0.0);
        assert!(f64_eq(pe1.p_suc, 1.0));
        assert!(f64_eq(pe2.p_suc, 1.0));
    }

    /// 不允许与另一端的邻居形成两粒子环.
    #[test]
    fn test_stage_connect_excludes_other_end() {
        let mut s = state();
        let mut c = computer(1e-3);
        let a = s.grid.add(Point::new(5.0, 5.0, 5.0), Point::z()).unwrap();
        let b = s.grid.add(Point::new(5.0, 5.0, 6.0), Point::z()).unwrap();
        s.grid
            .connect(&ParticleEnd::new(a, -1), &ParticleEnd::new(b, 1))
            .unwrap();
        for _ in 0..20 {
            let mut pe1 = ParticleEnd::new(a, 1);
            let mut pe2 = ParticleEnd::none();
            c.stage_connect(&s, &mut pe1, &mut pe2).unwrap();
            assert_ne!(pe2.par, Some(b));
            c.clear_changes();
        }
    }

    /// 连接被拉长到 `L` 之外时, 端点保持现有连接, 不会提议断开或改连.
    #[test]
    fn test_stage_connect_keeps_stretched_link() {
        let mut s = state();
        let mut c = computer(1.0);
        let p = s.grid.add(Point::new(10.0, 10.0, 10.0), Point::z()).unwrap();
        // p 的 +1 端在 z = 11, o 的 -1 端在 z = 12.5.
        let o = s.grid.add(Point::new(10.0, 10.0, 13.5), Point::z()).unwrap();
        s.grid
            .connect(&ParticleEnd::new(p, 1), &ParticleEnd::new(o, -1))
            .unwrap();
        // 与 p 的 +1 端重合的自由端.
        let _q = s.grid.add(Point::new(10.0, 10.0, 12.0), Point::z()).unwrap();

        for _ in 0..200 {
            let mut pe1 = ParticleEnd::new(p, 1);
            let mut pe2 = ParticleEnd::none();
            let d = c.stage_connect(&s, &mut pe1, &mut pe2).unwrap();
            assert_eq!((pe2.par, pe2.alpha), (Some(o), -1));
            assert_eq!(d, 0.0);
            c.clear_changes();
        }
    }

    /// 每个被提议的改动都能被逆提议恢复, 且逆提议概率与正向提议记录的 `p_rev` 一致.
    #[test]
    fn test_stage_connect_is_reversible() {
        let mut s = state();
        let mut c = computer(0.5);
        let mut rng = ChaCha8Rng::seed_from_u64(23);
        let p = s.grid.add(Point::new(10.0, 10.0, 10.0), Point::z()).unwrap();
        let o = s.grid.add(Point::new(10.0, 10.0, 11.8), Point::z()).unwrap();
        s.grid
            .connect(&ParticleEnd::new(p, 1), &ParticleEnd::new(o, -1))
            .unwrap();
        let ep = Point::new(10.0, 10.0, 11.0);
        for _ in 0..8 {
            let pos = ep + random_unit(&mut rng) * rng.gen_range(0.2..1.8);
            s.grid.add(pos, random_unit(&mut rng)).unwrap();
        }

        let mut changed = 0;
        for _ in 0..300 {
            let before = s.grid.partner(p, 1);
            let mut pe1 = ParticleEnd::new(p, 1);
            let mut pe2 = ParticleEnd::none();
            c.stage_connect(&s, &mut pe1, &mut pe2).unwrap();
            c.clear_changes();
            let after = pe2.par.map(|q| (q, pe2.alpha));
            if after == before {
                continue;
            }
            changed += 1;

            s.grid.disconnect(p, 1).unwrap();
            s.grid.connect(&ParticleEnd::new(p, 1), &pe2).unwrap();

            let slot = c
                .scan_neighbourhood(&s.grid, &ParticleEnd::new(p, 1))
                .unwrap();
            assert!(slot.is_some());
            let back = c
                .neighbourhood
                .iter()
                .find(|e| e.par.map(|q| (q, e.alpha)) == before)
                .copied();
            let back = back.expect("previous state must be a reverse candidate");
            assert!((back.p_suc - pe1.p_suc).abs() < 1e-9);

            // 恢复原状态.
            s.grid.disconnect(p, 1).unwrap();
            if let Some((q, beta)) = before {
                s.grid
                    .connect(&ParticleEnd::new(p, 1), &ParticleEnd::new(q, beta))
                    .unwrap();
            }
            s.grid.check_consistency().unwrap();
        }
        assert!(changed > 0);
    }
}
