//! Diagnostic files written after each decode cycle.
//!
//! Flow files hold one line per flow, `FlowKey PacketCount ByteCount`:
//!
//! ```text
//! 10.0.0.1 10.0.1.2 TCP 40000 80 10 1000
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use csv::{QuoteStyle, Writer, WriterBuilder};
use tracing::debug;

use crate::cms::Sketch;
use crate::error::RadarResult;
use crate::flow::{DecodedFlow, FlowKey, FlowStats};

#[derive(Debug, Clone)]
pub struct FlowWriter {
    dir: PathBuf,
}

impl FlowWriter {
    pub fn new<P: AsRef<Path>>(dir: P) -> RadarResult<FlowWriter> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(FlowWriter {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    pub fn flow_path(&self, switch_id: usize, time: f64, kind: &str) -> PathBuf {
        self.dir.join(format!("sw-{}-t-{}-{}-flow.txt", switch_id, time, kind))
    }

    pub fn block_path(&self, switch_id: usize, time: f64, block: usize) -> PathBuf {
        self.dir.join(format!("s-{}-t-{}-b-{}.txt", switch_id, time, block))
    }

    pub fn write_measured(
        &self,
        switch_id: usize,
        time: f64,
        flows: &[DecodedFlow],
    ) -> RadarResult<PathBuf> {
        let path = self.flow_path(switch_id, time, "measured");
        write_flows(&path, flows.iter().map(|f| (&f.key, &f.stats)))?;
        Ok(path)
    }

    /// Ground truth, sorted by key so runs are comparable.
    pub fn write_real(
        &self,
        switch_id: usize,
        time: f64,
        flows: &HashMap<FlowKey, FlowStats>,
    ) -> RadarResult<PathBuf> {
        let path = self.flow_path(switch_id, time, "real");
        let mut sorted: Vec<_> = flows.iter().collect();
        sorted.sort_by_key(|(k, _)| **k);
        write_flows(&path, sorted.into_iter())?;
        Ok(path)
    }

    /// Offline dump: flow table then counter table of every block.
    pub fn write_blocks(
        &self,
        switch_id: usize,
        time: f64,
        sketch: &Sketch,
    ) -> RadarResult<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(sketch.num_blocks());
        for (bi, block) in sketch.blocks.iter().enumerate() {
            let path = self.block_path(switch_id, time, bi);
            let mut file = BufWriter::new(File::create(&path)?);
            writeln!(file, "flows {}", block.flow_table.len())?;
            for entry in &block.flow_table {
                writeln!(file, "{}", entry)?;
            }
            writeln!(file, "counters")?;
            for cell in &block.count_table {
                writeln!(file, "{}", cell)?;
            }
            file.flush()?;
            paths.push(path);
        }
        debug!(switch = switch_id, time, blocks = paths.len(), "blocks dumped");
        Ok(paths)
    }
}

fn flow_writer(path: &Path) -> RadarResult<Writer<File>> {
    Ok(WriterBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .quote_style(QuoteStyle::Never)
        .from_path(path)?)
}

fn write_flows<'a, I>(path: &Path, flows: I) -> RadarResult<()>
where
    I: Iterator<Item = (&'a FlowKey, &'a FlowStats)>,
{
    let mut wtr = flow_writer(path)?;
    for (key, stats) in flows {
        wtr.write_record(&[
            key.src().to_string(),
            key.dst().to_string(),
            key.proto_name(),
            key.src_port.to_string(),
            key.dst_port.to_string(),
            stats.packets.to_string(),
            stats.bytes.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}
