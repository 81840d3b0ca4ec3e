//! Benchmark recorder: named checkpoints of one clone run, appended as one
//! CSV row per run. Every row has the same [`COLUMNS`]; a checkpoint the run
//! never reached is an empty cell.

use crate::error::CloneResult;
use crate::request::CloneStrategy;

use std::fs::OpenOptions;
use std::path::Path;
use tokio::time::Instant;

pub const INITIALIZED: &str = "initialized";
pub const CLONED: &str = "cloned";
pub const RECONFIGURED: &str = "reconfigured";
pub const CUSTOMIZED: &str = "customized";
pub const IP_DETECTED: &str = "ip_detected";
pub const TOTAL: &str = "total";

/// Checkpoint columns, in file order.
pub const COLUMNS: &[&str] = &[INITIALIZED, CLONED, RECONFIGURED, CUSTOMIZED, IP_DETECTED, TOTAL];

#[derive(Debug, Clone)]
pub struct BenchmarkRun {
    template: String,
    strategy: CloneStrategy,
    active_discovery: bool,
    started: Instant,
    checkpoints: Vec<(String, f64)>,
}

impl BenchmarkRun {
    pub fn start(template: impl Into<String>, strategy: CloneStrategy, active_discovery: bool) -> Self {
        Self {
            template: template.into(),
            strategy,
            active_discovery,
            started: Instant::now(),
            checkpoints: Vec::new(),
        }
    }

    /// Strategy actually used; a downgrade happens after `start`.
    pub fn set_strategy(&mut self, strategy: CloneStrategy) {
        self.strategy = strategy;
    }

    pub fn checkpoint(&mut self, name: &str) {
        if !COLUMNS.contains(&name) {
            log::warn!("Benchmark checkpoint {name} has no column, it will not be written");
        }
        let secs = self.started.elapsed().as_secs_f64();
        log::debug!("Benchmark checkpoint {name} at {secs:.3}s");
        self.checkpoints.push((name.to_string(), secs));
    }

    pub fn checkpoints(&self) -> &[(String, f64)] {
        &self.checkpoints
    }

    fn header() -> Vec<String> {
        let mut h = vec!["template".to_string(), "clonetype".into(), "active_discovery".into()];
        h.extend(COLUMNS.iter().map(|c| c.to_string()));
        h
    }

    fn cell(&self, column: &str) -> String {
        self.checkpoints
            .iter()
            .rev()
            .find(|(n, _)| n == column)
            .map(|(_, s)| format!("{s:.3}"))
            .unwrap_or_default()
    }

    fn row(&self) -> Vec<String> {
        let mut r = vec![
            self.template.clone(),
            self.strategy.to_string(),
            self.active_discovery.to_string(),
        ];
        r.extend(COLUMNS.iter().map(|c| self.cell(c)));
        r
    }

    /// Append this run to `path`, writing the header when the file is new.
    pub fn persist(&mut self, path: impl AsRef<Path>) -> CloneResult<()> {
        let path = path.as_ref();
        if self.checkpoints.last().map(|(n, _)| n.as_str()) != Some(TOTAL) {
            self.checkpoint(TOTAL);
        }

        let is_new = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if is_new {
            writer.write_record(Self::header())?;
        }
        writer.write_record(self.row())?;
        writer.flush()?;
        log::info!("Benchmark data written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn header_once_rows_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.csv");

        let mut run = BenchmarkRun::start("templates/ubuntu", CloneStrategy::Linked, false);
        tokio::time::advance(Duration::from_millis(1500)).await;
        run.checkpoint(CLONED);
        run.persist(&path).unwrap();

        let mut second = BenchmarkRun::start("templates/ubuntu", CloneStrategy::Full, true);
        second.checkpoint(CLONED);
        second.persist(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "template,clonetype,active_discovery,initialized,cloned,reconfigured,customized,ip_detected,total"
        );
        assert_eq!(lines[1], "templates/ubuntu,linked,false,,1.500,,,,1.500");
        assert!(lines[2].starts_with("templates/ubuntu,full,true,"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_and_successful_runs_share_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.csv");

        let mut failed = BenchmarkRun::start("templates/ubuntu", CloneStrategy::Full, false);
        failed.checkpoint(INITIALIZED);
        failed.checkpoint(CLONED);
        tokio::time::advance(Duration::from_secs(4)).await;
        failed.persist(&path).unwrap();

        let mut ok = BenchmarkRun::start("templates/ubuntu", CloneStrategy::Full, false);
        ok.checkpoint(INITIALIZED);
        ok.checkpoint(CLONED);
        ok.checkpoint(RECONFIGURED);
        tokio::time::advance(Duration::from_secs(2)).await;
        ok.checkpoint(IP_DETECTED);
        ok.persist(&path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let header = reader.headers().unwrap().clone();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.len() == header.len()));

        let col = |name: &str| header.iter().position(|h| h == name).unwrap();
        assert_eq!(&rows[0][col(IP_DETECTED)], "");
        assert_eq!(&rows[0][col(TOTAL)], "4.000");
        assert_eq!(&rows[1][col(RECONFIGURED)], "0.000");
        assert_eq!(&rows[1][col(IP_DETECTED)], "2.000");
        assert_eq!(&rows[1][col(CUSTOMIZED)], "");
    }

    #[tokio::test(start_paused = true)]
    async fn checkpoints_monotonic_total_last() {
        let mut run = BenchmarkRun::start("t", CloneStrategy::Full, false);
        run.checkpoint(INITIALIZED);
        tokio::time::advance(Duration::from_secs(2)).await;
        run.checkpoint(CLONED);
        let dir = tempfile::tempdir().unwrap();
        run.persist(dir.path().join("b.csv")).unwrap();

        let names: Vec<&str> = run.checkpoints().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec![INITIALIZED, CLONED, TOTAL]);
        let secs: Vec<f64> = run.checkpoints().iter().map(|(_, s)| *s).collect();
        assert!(secs.windows(2).all(|w| w[0] <= w[1]));
    }
}
