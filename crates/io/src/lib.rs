use anyhow::{Context, Result};
use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufWriter, Write},
    path::Path,
};
use serde::{Serialize, Deserialize};
use model::*;

/// Raw wire messages from a capture file, one per line. Blank lines and
/// lines starting with `#` are skipped.
pub fn load_capture(path: &Path) -> Result<Vec<String>> {
    let f = File::open(path).with_context(|| format!("open capture {}", path.display()))?;
    let rdr = std::io::BufReader::new(f);
    let mut lines = vec![];
    for line in rdr.lines() {
        let s = line?;
        let t = s.trim();
        if t.is_empty() || t.starts_with('#') {
            continue;
        }
        lines.push(t.to_string());
    }
    Ok(lines)
}

/// Appends raw wire messages to a capture file that `load_capture` can read back.
pub struct CaptureWriter {
    w: BufWriter<File>,
    written: u64,
}

impl CaptureWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open capture {} for append", path.display()))?;
        Ok(Self { w: BufWriter::new(f), written: 0 })
    }

    /// Messages spanning lines are flattened so the file stays one message per line.
    pub fn append(&mut self, raw: &str) -> Result<()> {
        let t = raw.trim();
        if t.is_empty() {
            return Ok(());
        }
        if t.contains('\n') {
            let flat: Vec<&str> = t.lines().map(str::trim).collect();
            writeln!(self.w, "{}", flat.join(" "))?;
        } else {
            writeln!(self.w, "{}", t)?;
        }
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn flush(&mut self) -> Result<()> {
        self.w.flush()?;
        Ok(())
    }
}

impl Drop for CaptureWriter {
    fn drop(&mut self) {
        let _ = self.w.flush();
    }
}

pub fn export_laps_ndjson(laps: &[LapRecord], path: &Path) -> Result<()> {
    let f = File::create(path)?;
    let mut w = BufWriter::new(f);
    for l in laps {
        let s = serde_json::to_string(l)?;
        writeln!(w, "{}", s)?;
    }
    w.flush()?;
    Ok(())
}

pub fn import_laps_ndjson(path: &Path) -> Result<Vec<LapRecord>> {
    let f = File::open(path)?;
    let rdr = std::io::BufReader::new(f);
    let mut laps = vec![];
    for line in rdr.lines() {
        let s = line?;
        if s.trim().is_empty() {
            continue;
        }
        let l: LapRecord = serde_json::from_str(&s)?;
        laps.push(l);
    }
    Ok(laps)
}

/// One row per trace point, for spreadsheets and plotting tools.
pub fn export_laps_csv(laps: &[LapRecord], path: &Path) -> Result<()> {
    let mut w = csv::Writer::from_path(path)?;
    for l in laps {
        for p in &l.points {
            w.serialize(CsvRow {
                lap_id: l.id.simple().to_string(),
                lap_number: l.lap_number,
                elapsed_s: p.elapsed_s,
                distance_m: p.distance_m,
                lat: p.lat,
                lon: p.lon,
                speed_kph: p.speed_kph,
                heading_deg: p.heading_deg,
                lateral_g: p.lateral_g,
                sector: p.sector,
            })?;
        }
    }
    w.flush()?;
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct CsvRow {
    lap_id: String,
    lap_number: u32,
    elapsed_s: f64,
    distance_m: f64,
    lat: f64,
    lon: f64,
    speed_kph: f64,
    heading_deg: f64,
    lateral_g: f64,
    sector: usize,
}
