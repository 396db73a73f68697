//! 实验结果.

use dwi_berry::gt::{GtError, MoveKind, StatsSnapshot};
use std::io::{self, Write};
use std::time::Duration;

/// 单组退火设置的运行概况.
#[derive(Debug)]
pub struct Profile {
    /// 结束时的统计.
    pub snapshot: StatsSnapshot,
    pub n_particles: usize,
    pub n_tracks: usize,

    /// 轨迹平均长度 (毫米). 没有轨迹时为 `None`.
    pub mean_track_length: Option<f64>,
    pub elapsed: Duration,
}

/// 将 `profile` 的结果写进 `w` 中.
fn describe_into<W: Write>(name: &str, p: &Profile, w: &mut W) -> io::Result<()> {
    const S4: &str = "    ";

    #[inline]
    fn f64_to_display(f: Option<f64>) -> String {
        match f {
            Some(f) => format!("{f:.3}"),
            None => "/".to_string(),
        }
    }

    let s = &p.snapshot;
    writeln!(w, "Profile `{name}`:")?;
    writeln!(w, "{S4}Iterations: {}", s.n_iter)?;
    writeln!(w, "{S4}Final temperatures: Tint = {:.4e}, Text = {:.4e}", s.tint, s.text)?;
    writeln!(w, "{S4}Energies: Eext = {:.6}, Eint = {:.6}", s.eext_tot, s.eint_tot)?;
    for (k, r) in MoveKind::ALL.iter().zip(s.acceptance) {
        writeln!(w, "{S4}Acceptance `{k}`: {r:.4}")?;
    }
    writeln!(w, "{S4}Particles: {}", p.n_particles)?;
    writeln!(w, "{S4}Tracks: {}", p.n_tracks)?;
    writeln!(
        w,
        "{S4}Mean track length: {} mm",
        f64_to_display(p.mean_track_length)
    )?;
    write!(w, "{S4}Total machine time: {} ms", p.elapsed.as_millis())?;
    Ok(())
}

/// 消融实验最终结果.
pub struct AblationResult {
    data: Vec<(&'static str, Result<Profile, GtError>)>,
}

impl AblationResult {
    pub fn from_iter<I>(it: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, Result<Profile, GtError>)>,
    {
        Self {
            data: it.into_iter().collect(),
        }
    }

    /// 分析运行结果.
    pub fn analyze(&self) {
        utils::sep();
        let mut buf = Vec::with_capacity(512);

        for (key, profile) in self.data.iter() {
            match profile {
                Ok(p) => describe_into(key, p, &mut buf).unwrap(),
                Err(e) => write!(&mut buf, "Profile `{key}` failed: {e}").unwrap(),
            }
            println!("{}", std::str::from_utf8(&buf).unwrap());
            buf.clear();

            utils::sep();
        }
    }
}
