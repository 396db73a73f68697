//! 退火控制与采样统计.
//!
//! 内部温度 `Tint` 经历三个阶段:
//!
//! 1. 预热: 前 `FRACTION_BURNIN` 的迭代保持 `T0`;
//! 2. 降温: 每个大步乘以固定比例 `alpha`;
//! 3. 冻结: 最后 `FRACTION_PHASEOUT` 的迭代保持 `T1`.
//!
//! `alpha` 由降温步数反推, 最后一次降温直接取 `T1`, 因此终止时 `Tint == T1`.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::consts::anneal::{FRACTION_BURNIN, FRACTION_PHASEOUT, MAX_BIGSTEP};

use super::error::ConfigError;
use super::{AnnealConfig, GtResult};

/// 提议类型.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MoveKind {
    /// 出生, `b`.
    Birth,

    /// 死亡, `d`.
    Death,

    /// 随机平移, `r`.
    Shift,

    /// 最优平移, `o`.
    OptShift,

    /// 连接, `c`.
    Connect,
}

impl MoveKind {
    /// 全部提议类型, 与日志列顺序一致.
    pub const ALL: [MoveKind; 5] = [
        MoveKind::Birth,
        MoveKind::Death,
        MoveKind::Shift,
        MoveKind::OptShift,
        MoveKind::Connect,
    ];

    /// 单字符标记.
    #[inline]
    pub const fn tag(self) -> char {
        match self {
            MoveKind::Birth => 'b',
            MoveKind::Death => 'd',
            MoveKind::Shift => 'r',
            MoveKind::OptShift => 'o',
            MoveKind::Connect => 'c',
        }
    }

    /// 由单字符标记解析.
    pub const fn from_tag(c: char) -> Option<Self> {
        match c {
            'b' => Some(MoveKind::Birth),
            'd' => Some(MoveKind::Death),
            'r' => Some(MoveKind::Shift),
            'o' => Some(MoveKind::OptShift),
            'c' => Some(MoveKind::Connect),
            _ => None,
        }
    }

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for MoveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// 某一时刻的统计快照.
///
/// `Display` 输出一行以空格分隔的数值:
/// `iter Tint Text EextTot EintTot b d r o c`, 后五列为各类提议的接受率.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StatsSnapshot {
    /// 已完成迭代次数.
    pub n_iter: usize,

    /// 内部温度.
    pub tint: f64,

    /// 外部温度.
    pub text: f64,

    /// 外部能量累计.
    pub eext_tot: f64,

    /// 内部能量累计.
    pub eint_tot: f64,

    /// 各类提议的接受率, 顺序同 [`MoveKind::ALL`].
    pub acceptance: [f64; 5],
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:.6e} {:.6e} {:.6e} {:.6e}",
            self.n_iter, self.tint, self.text, self.eext_tot, self.eint_tot
        )?;
        for a in self.acceptance {
            write!(f, " {a:.6}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Inner {
    n_iter: usize,
    cooled: usize,
    tint: f64,
    eext_tot: f64,
    eint_tot: f64,
    n: [u64; 5],
    na: [u64; 5],
    stream: Option<BufWriter<File>>,
}

impl Inner {
    fn acceptance(&self, k: usize) -> f64 {
        if self.n[k] == 0 {
            0.0
        } else {
            self.na[k] as f64 / self.n[k] as f64
        }
    }
}

/// 线程安全的退火控制器与统计累加器.
///
/// 所有修改都经过内部唯一的互斥锁. 统计更新相对能量计算并不频繁, 粗粒度锁足够.
#[derive(Debug)]
pub struct Stats {
    t0: f64,
    t1: f64,
    text: f64,
    n_max: usize,
    bigstep: usize,
    burnin_end: usize,
    phaseout_start: usize,
    cool_steps: usize,
    alpha: f64,
    cancelled: AtomicBool,
    inner: Mutex<Inner>,
}

impl Stats {
    /// 以初始温度 `t0`, 最终温度 `t1` 与最大迭代次数 `n_max` 构建.
    ///
    /// 温度必须为有限正数, 且 `n_max > 0`.
    pub fn new(t0: f64, t1: f64, n_max: usize) -> Result<Self, ConfigError> {
        for (name, t) in [("t0", t0), ("t1", t1)] {
            if !(t.is_finite() && t > 0.0) {
                return Err(ConfigError::NotPositive(name, t));
            }
        }
        if n_max == 0 {
            return Err(ConfigError::NoIterations);
        }

        let bigstep = (n_max / 100).clamp(1, MAX_BIGSTEP);
        let burnin_end = (FRACTION_BURNIN * n_max as f64) as usize;
        let phaseout_start = n_max - (FRACTION_PHASEOUT * n_max as f64) as usize;

        // 落在 [burnin_end, phaseout_start) 内的大步个数.
        let first = burnin_end.max(1).div_ceil(bigstep) * bigstep;
        let cool_steps = if first < phaseout_start {
            (phaseout_start - 1 - first) / bigstep + 1
        } else {
            0
        };
        let alpha = if cool_steps > 0 {
            (t1 / t0).powf(1.0 / cool_steps as f64)
        } else {
            1.0
        };

        Ok(Self {
            t0,
            t1,
            text: t1,
            n_max,
            bigstep,
            burnin_end,
            phaseout_start,
            cool_steps,
            alpha,
            cancelled: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                tint: t0,
                ..Default::default()
            }),
        })
    }

    /// 校验配置后构建.
    pub fn from_config(cfg: &AnnealConfig) -> GtResult<Self> {
        cfg.validate()?;
        Ok(Self::new(cfg.t0, cfg.t1, cfg.max_iter)?)
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 打开日志文件. 此后每个大步追加一行快照.
    pub fn open_stream<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let f = File::create(path)?;
        self.lock().stream = Some(BufWriter::new(f));
        Ok(())
    }

    /// 刷新并关闭日志文件.
    pub fn close_stream(&self) -> io::Result<()> {
        match self.lock().stream.take() {
            Some(mut s) => s.flush(),
            None => Ok(()),
        }
    }

    /// 推进一次迭代. 返回 `false` 表示采样应当结束.
    pub fn next(&self) -> bool {
        let mut g = self.lock();
        g.n_iter += 1;
        let n = g.n_iter;

        if n % self.bigstep == 0 {
            if n >= self.burnin_end && n < self.phaseout_start && g.cooled < self.cool_steps {
                g.cooled += 1;
                g.tint = if g.cooled == self.cool_steps {
                    self.t1
                } else {
                    self.t0 * self.alpha.powi(g.cooled as i32)
                };
            }
            log::debug!(
                "[{:>5.1}%] iter {n}, Tint = {:.4e}, EintTot = {:.4e}, EextTot = {:.4e}",
                100.0 * n.min(self.n_max) as f64 / self.n_max as f64,
                g.tint,
                g.eint_tot,
                g.eext_tot
            );
            let line = Self::snapshot_of(&g, self.text);
            let failed = match g.stream.as_mut() {
                Some(s) => writeln!(s, "{line}").err(),
                None => None,
            };
            if let Some(e) = failed {
                log::warn!("Failed to write stats log, stream closed: {e}");
                g.stream = None;
            }
        }

        if n >= self.n_max {
            g.tint = self.t1;
            return false;
        }
        !self.cancelled.load(Ordering::Acquire)
    }

    /// 请求所有工作线程尽快结束. 下一次 `next()` 返回 `false`.
    #[inline]
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// 是否已经被取消.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// 记录一次 `kind` 类型的提议.
    #[inline]
    pub fn inc_n(&self, kind: MoveKind) {
        self.lock().n[kind.index()] += 1;
    }

    /// 记录一次被接受的 `kind` 类型的提议.
    #[inline]
    pub fn inc_na(&self, kind: MoveKind) {
        self.lock().na[kind.index()] += 1;
    }

    /// `kind` 类型提议的接受率. 尚未提议过时为 0.
    #[inline]
    pub fn acceptance_rate(&self, kind: MoveKind) -> f64 {
        self.lock().acceptance(kind.index())
    }

    /// 累加外部能量.
    ///
    /// 与 [`Stats::inc_eint_tot`] 相同, 累加的是未乘 `lam_ext` 的能量变化.
    #[inline]
    pub fn inc_eext_tot(&self, d: f64) {
        self.lock().eext_tot += d;
    }

    /// 累加内部能量.
    ///
    /// 累加的是各能量项自身的变化量, 不乘 `lam_int`. 因此 `eint_tot` 总是等于
    /// [`InternalEnergyComputer::eval`](super::InternalEnergyComputer) 的结果,
    /// 与接受判断所用的加权能量相差一个权重因子.
    #[inline]
    pub fn inc_eint_tot(&self, d: f64) {
        self.lock().eint_tot += d;
    }

    /// 当前内部温度.
    #[inline]
    pub fn tint(&self) -> f64 {
        self.lock().tint
    }

    /// 外部温度 (整个运行期间不变).
    #[inline]
    pub fn text(&self) -> f64 {
        self.text
    }

    /// 初始内部温度.
    #[inline]
    pub fn t0(&self) -> f64 {
        self.t0
    }

    /// 最终内部温度.
    #[inline]
    pub fn t1(&self) -> f64 {
        self.t1
    }

    /// 每次降温的比例.
    #[inline]
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// 大步长度.
    #[inline]
    pub fn bigstep(&self) -> usize {
        self.bigstep
    }

    /// 最大迭代次数.
    #[inline]
    pub fn n_max(&self) -> usize {
        self.n_max
    }

    /// 已完成迭代次数.
    #[inline]
    pub fn n_iter(&self) -> usize {
        self.lock().n_iter
    }

    /// 外部能量累计 (未加权).
    #[inline]
    pub fn eext_tot(&self) -> f64 {
        self.lock().eext_tot
    }

    /// 内部能量累计 (未加权).
    #[inline]
    pub fn eint_tot(&self) -> f64 {
        self.lock().eint_tot
    }

    /// 当前统计快照.
    pub fn snapshot(&self) -> StatsSnapshot {
        Self::snapshot_of(&self.lock(), self.text)
    }

    fn snapshot_of(g: &Inner, text: f64) -> StatsSnapshot {
        let mut acceptance = [0.0; 5];
        for (k, a) in acceptance.iter_mut().enumerate() {
            *a = g.acceptance(k);
        }
        StatsSnapshot {
            n_iter: g.n_iter,
            tint: g.tint,
            text,
            eext_tot: g.eext_tot,
            eint_tot: g.eint_tot,
            acceptance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MoveKind, Stats};
    use crate::gt::error::ConfigError;
    use crate::gt::{AnnealConfig, GtError};
    use std::io::Read;

    #[test]
    fn test_terminal_condition() {
        for n_max in [1, 2, 7, 99, 100, 101, 1234, 20_000] {
            let s = Stats::new(1.0, 0.5, n_max).unwrap();
            for i in 1..n_max {
                assert!(s.next(), "n_max = {n_max}, call {i}");
            }
            assert!(!s.next());
            assert!(!s.next());
            assert!((s.tint() - 0.5).abs() < 1e-12);
        }
    }

    #[test]
    fn test_end_to_end_cooling() {
        let s = Stats::new(10.0, 0.1, 100_000).unwrap();
        assert_eq!(s.bigstep(), 1000);
        let mut last = s.tint();
        let mut stops = 0;
        for i in 1..=100_000 {
            let go = s.next();
            if !go {
                stops += 1;
                assert_eq!(i, 100_000);
            }
            let t = s.tint();
            assert!(t <= last + 1e-15);
            last = t;
        }
        assert_eq!(stops, 1);
        assert!((s.tint() - 0.1).abs() < 1e-9);
        assert!((s.text() - 0.1).abs() < 1e-15);
    }

    #[test]
    fn test_cooling_window() {
        let s = Stats::new(4.0, 1.0, 1000).unwrap();
        // 预热阶段不降温.
        for _ in 0..99 {
            s.next();
        }
        assert_eq!(s.tint(), 4.0);
        // 冻结阶段之前已经到达 T1.
        for _ in 99..900 {
            s.next();
        }
        assert!((s.tint() - 1.0).abs() < 1e-12);
        let t = s.tint();
        for _ in 900..999 {
            assert!(s.next());
            assert_eq!(s.tint(), t);
        }
    }

    #[test]
    fn test_acceptance_rate() {
        let s = Stats::new(1.0, 1.0, 10).unwrap();
        assert_eq!(s.acceptance_rate(MoveKind::Birth), 0.0);
        for _ in 0..4 {
            s.inc_n(MoveKind::Birth);
        }
        s.inc_na(MoveKind::Birth);
        s.inc_n(MoveKind::Connect);
        s.inc_na(MoveKind::Connect);
        assert_eq!(s.acceptance_rate(MoveKind::Birth), 0.25);
        assert_eq!(s.acceptance_rate(MoveKind::Connect), 1.0);
        assert_eq!(s.acceptance_rate(MoveKind::Death), 0.0);

        s.inc_eint_tot(-1.5);
        s.inc_eext_tot(2.0);
        s.inc_eint_tot(0.5);
        let snap = s.snapshot();
        assert_eq!(snap.eint_tot, -1.0);
        assert_eq!(snap.eext_tot, 2.0);
        assert_eq!(snap.acceptance, [0.25, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_move_tags() {
        for k in MoveKind::ALL {
            assert_eq!(MoveKind::from_tag(k.tag()), Some(k));
        }
        assert_eq!(MoveKind::from_tag('x'), None);
    }

    #[test]
    fn test_log_stream() {
        let path = std::env::temp_dir().join(format!("dwi-berry-stats-{}.txt", std::process::id()));
        let s = Stats::new(2.0, 1.0, 1000).unwrap();
        s.open_stream(&path).unwrap();
        while s.next() {}
        s.close_stream().unwrap();

        let mut text = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        std::fs::remove_file(&path).unwrap();

        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 100);
        assert!(lines.iter().all(|l| l.split_whitespace().count() == 10));
        assert!(lines[0].starts_with("10 "));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_cancel() {
        let s = Stats::new(1.0, 0.5, 100).unwrap();
        assert!(s.next());
        s.cancel();
        assert!(s.is_cancelled());
        assert!(!s.next());
        assert!(s.n_iter() < s.n_max());
    }

    #[test]
    fn test_stream_open_failure() {
        let s = Stats::new(1.0, 0.5, 100).unwrap();
        let bad = std::env::temp_dir().join("no-such-dir-dwi-berry").join("x.txt");
        assert!(s.open_stream(bad).is_err());
        while s.next() {}
        assert!(s.close_stream().is_ok());
    }

    #[test]
    fn test_invalid_schedule() {
        assert_eq!(
            Stats::new(0.0, 0.1, 10).unwrap_err(),
            ConfigError::NotPositive("t0", 0.0)
        );
        assert!(matches!(
            Stats::new(1.0, f64::NAN, 10),
            Err(ConfigError::NotPositive("t1", _))
        ));
        assert_eq!(
            Stats::new(1.0, 0.1, 0).unwrap_err(),
            ConfigError::NoIterations
        );

        let cfg = AnnealConfig {
            t1: -1.0,
            ..Default::default()
        };
        assert!(matches!(
            Stats::from_config(&cfg),
            Err(GtError::Config(ConfigError::NotPositive("t1", _)))
        ));
    }
}
