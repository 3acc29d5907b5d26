use crate::common::{DevMode, Result};
use crate::core::matcher::Matcher;
use crate::storage::{AttendanceEvent, GalleryEntry};
use std::fs;
use std::path::{Path, PathBuf};

/// Writes text reports about the gallery and ledger.
pub struct Visualizer {
    output_dir: PathBuf,
}

impl Visualizer {
    pub fn new(dev_mode: &DevMode) -> Result<Self> {
        Self::with_output_dir(dev_mode.reports_dir())
    }

    pub fn with_output_dir(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)?;
        Ok(Self { output_dir })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Template-vs-template match scores. Off-diagonal scores between
    /// different identities close to the accept threshold point at weak
    /// separation in the gallery.
    pub fn generate_score_matrix(&self, gallery: &[GalleryEntry], matcher: &Matcher) -> Result<PathBuf> {
        let output_file = self.output_dir.join("score_matrix.txt");
        let matrix = matcher.score_matrix(gallery);

        let mut content = String::new();
        content.push_str(&format!("Template score matrix ({} templates)\n\n", gallery.len()));

        for (i, entry) in gallery.iter().enumerate() {
            content.push_str(&format!("{:>3}: {} ({} descriptors)\n", i, entry.identity_id, entry.template.descriptors.len()));
        }
        content.push('\n');

        content.push_str("     ");
        for j in 0..gallery.len() {
            content.push_str(&format!("{:>5}", j));
        }
        content.push('\n');
        for (i, row) in matrix.iter().enumerate() {
            content.push_str(&format!("{:>3}: ", i));
            for score in row {
                content.push_str(&format!("{:>5}", score));
            }
            content.push('\n');
        }

        let mut worst_impostor: Option<(usize, usize, u32)> = None;
        for (i, row) in matrix.iter().enumerate() {
            for (j, &score) in row.iter().enumerate().skip(i + 1) {
                if gallery[i].identity_id != gallery[j].identity_id
                    && worst_impostor.map_or(true, |(_, _, s)| score > s)
                {
                    worst_impostor = Some((i, j, score));
                }
            }
        }
        if let Some((i, j, score)) = worst_impostor {
            content.push_str(&format!(
                "\nHighest cross-identity score: {} ({} vs {})\n",
                score, gallery[i].identity_id, gallery[j].identity_id
            ));
        }

        fs::write(&output_file, content)?;
        println!("Saved score matrix to {}", output_file.display());
        Ok(output_file)
    }

    /// Per-template descriptor statistics.
    pub fn generate_descriptor_stats(&self, gallery: &[GalleryEntry]) -> Result<PathBuf> {
        let output_file = self.output_dir.join("descriptor_stats.txt");

        let mut content = String::new();
        content.push_str(&format!("Descriptor statistics ({} templates)\n\n", gallery.len()));

        for (i, entry) in gallery.iter().enumerate() {
            let set = &entry.template.descriptors;
            let bits: Vec<u32> = set
                .iter()
                .map(|d| d.iter().map(|b| b.count_ones()).sum())
                .collect();
            let mean = if bits.is_empty() {
                0.0
            } else {
                bits.iter().sum::<u32>() as f32 / bits.len() as f32
            };
            let min = bits.iter().copied().min().unwrap_or(0);
            let max = bits.iter().copied().max().unwrap_or(0);

            content.push_str(&format!("Template {} ({}):\n", i, entry.identity_id));
            content.push_str(&format!("  Enrolled: {}\n", entry.template.created_at.to_rfc3339()));
            content.push_str(&format!("  Descriptors: {}\n", set.len()));
            content.push_str(&format!("  Set bits per descriptor: mean {:.1}, min {}, max {}\n", mean, min, max));
            content.push('\n');
        }

        fs::write(&output_file, content)?;
        println!("Saved descriptor statistics to {}", output_file.display());
        Ok(output_file)
    }

    /// Ledger export for spreadsheets.
    pub fn export_ledger_csv(&self, events: &[AttendanceEvent]) -> Result<PathBuf> {
        let output_file = self.output_dir.join("attendance.csv");

        let mut content = String::from("sequence,timestamp,identity_id,display_name,score,event\n");
        for event in events {
            content.push_str(&format!(
                "{},{},{},{},{},{}\n",
                event.sequence,
                event.timestamp.to_rfc3339(),
                csv_field(event.identity_id.as_deref().unwrap_or("")),
                csv_field(event.display_name.as_deref().unwrap_or("")),
                event.match_score.map(|s| s.to_string()).unwrap_or_default(),
                event.kind.as_str()
            ));
        }

        fs::write(&output_file, content)?;
        println!("Exported {} events to {}", events.len(), output_file.display());
        Ok(output_file)
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
