// CCTESTBED: Automated Congestion-Control Experiments on Controlled Network Testbeds
// Copyright (C) 2024-2025 The cctestbed developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Experiment naming and completion markers.
//!
//! The presence of an archive `<name>-<timestamp>.tar.gz` under the data
//! directory is the *only* idempotency mechanism: repeated invocations skip an
//! experiment iff such an archive exists, unless forced.

use std::path::Path;

/// Parameters that uniquely identify an experiment run. The derived name is
/// never reused for a different parameter set.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExperimentParams {
    pub ccalg: String,
    /// Bottleneck bandwidth in Mbps.
    pub btlbw: u64,
    /// Target RTT in milliseconds.
    pub rtt: u64,
    /// Shaping queue size in packets.
    pub queue_size: u64,
    /// Site or region suffix, e.g. `local` or `uswest1`.
    pub site: String,
}

impl ExperimentParams {
    pub fn new(
        ccalg: impl Into<String>,
        btlbw: u64,
        rtt: u64,
        queue_size: u64,
        site: impl Into<String>,
    ) -> Self {
        Self {
            ccalg: ccalg.into(),
            btlbw,
            rtt,
            queue_size,
            site: site.into().replace('-', ""),
        }
    }

    /// Deterministic, collision-free token usable as a filesystem/archive key.
    pub fn name(&self) -> String {
        format!(
            "{}-{}bw-{}rtt-{}q-{}",
            self.ccalg, self.btlbw, self.rtt, self.queue_size, self.site
        )
    }
}

/// True iff a completion marker for `name` exists under `data_dir`.
pub fn is_completed(data_dir: &Path, name: &str) -> bool {
    // the directory may contain glob metacharacters, only the `*` is ours
    let prefix = glob::Pattern::escape(&format!("{}/{name}-", data_dir.display()));
    glob::glob(&format!("{prefix}*.tar.gz"))
        .map(|matches| matches.filter_map(Result::ok).next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use itertools::iproduct;

    use super::*;

    #[test]
    fn name_is_deterministic() {
        let a = ExperimentParams::new("cubic", 10, 85, 128, "uswest1");
        let b = ExperimentParams::new("cubic", 10, 85, 128, "us-west-1");
        assert_eq!(a.name(), b.name());
        assert_eq!(a.name(), "cubic-10bw-85rtt-128q-uswest1");
    }

    #[test]
    fn name_is_injective_over_parameter_corpus() {
        let ccalgs = ["cubic", "reno", "bbr", "vegas"];
        let conditions = [(5, 35, 16), (10, 85, 128), (15, 275, 512)];
        let sites = ["local", "uswest1", "apnortheast1"];

        let names: HashSet<String> = iproduct!(&ccalgs, &conditions, &sites)
            .map(|(ccalg, (btlbw, rtt, queue), site)| {
                ExperimentParams::new(*ccalg, *btlbw, *rtt, *queue, *site).name()
            })
            .collect();
        assert_eq!(names.len(), ccalgs.len() * conditions.len() * sites.len());
    }

    #[test]
    fn completion_marker_lookup() {
        let dir = std::env::temp_dir().join(format!("cctestbed-identity-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let name = "cubic-10bw-85rtt-128q-local";

        assert!(!is_completed(&dir, name));

        let marker = dir.join(format!("{name}-2025-01-01_00-00-00.tar.gz"));
        std::fs::write(&marker, b"").unwrap();
        assert!(is_completed(&dir, name));
        // a different parameter set is unaffected
        assert!(!is_completed(&dir, "reno-10bw-85rtt-128q-local"));

        std::fs::remove_file(&marker).unwrap();
        assert!(!is_completed(&dir, name));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn completion_marker_lookup_in_directory_with_metacharacters() {
        let dir = std::env::temp_dir().join(format!("cctestbed-id[1]-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let name = "cubic-10bw-85rtt-128q-local";

        assert!(!is_completed(&dir, name));
        std::fs::write(dir.join(format!("{name}-2025-01-01_00-00-00.tar.gz")), b"").unwrap();
        assert!(is_completed(&dir, name));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
