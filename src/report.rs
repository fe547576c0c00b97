//! Read-side views over an [`AllocationLedger`]: a sorted site listing that
//! can be printed with symbols or written out as JSON.

use std::{
    cmp::Reverse,
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::ReportError,
    ledger::{AllocationLedger, LedgerStats},
    trace::StackTrace,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteReport {
    pub trace: StackTrace,
    pub live_bytes: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub stats: LedgerStats,
    /// Largest live footprint first, ties broken by stack hash
    pub sites: Vec<SiteReport>,
}

impl Report {
    pub fn from_ledger(ledger: &AllocationLedger) -> Self {
        // Two lock acquisitions: the stats may be a hair newer than the sites
        let sites = ledger.snapshot();
        Self::from_snapshot(sites, ledger.stats())
    }

    pub fn from_snapshot(snapshot: Vec<(StackTrace, usize)>, stats: LedgerStats) -> Self {
        let mut sites: Vec<_> = snapshot
            .into_iter()
            .map(|(trace, live_bytes)| SiteReport { trace, live_bytes })
            .collect();
        sites.sort_unstable_by_key(|site| (Reverse(site.live_bytes), site.trace.hash()));
        Self { stats, sites }
    }

    pub fn total_live_bytes(&self) -> usize {
        self.sites.iter().map(|site| site.live_bytes).sum()
    }

    /// Sites that still hold memory.
    pub fn live_sites(&self) -> impl Iterator<Item = &SiteReport> {
        self.sites.iter().filter(|site| site.live_bytes > 0)
    }

    /// The stats block, then every site that still holds memory with its
    /// symbolized stack.
    pub fn write_text<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: Write,
    {
        writeln!(w, "{}", self.stats)?;
        writeln!(w, "live bytes: {}", self.total_live_bytes())?;
        for site in self.live_sites() {
            writeln!(
                w,
                "\n{} bytes live from site {:#018x}:",
                site.live_bytes,
                site.trace.hash()
            )?;
            site.trace.write_symbolized(w)?;
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_to_file<P>(&self, path: P) -> Result<(), ReportError>
    where
        P: AsRef<Path>,
    {
        let mut file = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut file, self)?;
        file.flush()?;
        Ok(())
    }

    pub fn from_file<P>(path: P) -> Result<Self, ReportError>
    where
        P: AsRef<Path>,
    {
        let file = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(file)?)
    }
}
