use crate::common::config::MatcherConfig;
use crate::core::descriptor::{Descriptor, DescriptorSet};
use crate::storage::GalleryEntry;
use serde::{Deserialize, Serialize};

#[inline]
pub fn hamming(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Best identity over a gallery. `identity_id` is `None` when nothing
/// scored above zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identification {
    pub identity_id: Option<String>,
    pub display_name: Option<String>,
    pub score: u32,
}

impl Identification {
    pub fn none() -> Self {
        Self {
            identity_id: None,
            display_name: None,
            score: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Matcher {
    config: MatcherConfig,
}

impl Matcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    /// Nearest-neighbour index and distance for each descriptor of `from`
    /// within `to`. Ties go to the lowest index.
    fn nearest(from: &[Descriptor], to: &[Descriptor]) -> Vec<(usize, u32)> {
        from.iter()
            .map(|d| {
                to.iter()
                    .enumerate()
                    .map(|(j, t)| (j, hamming(d, t)))
                    .min_by_key(|&(j, dist)| (dist, j))
                    .unwrap_or((usize::MAX, u32::MAX))
            })
            .collect()
    }

    /// Number of mutual nearest neighbours within `max_distance`. Sets
    /// smaller than `min_descriptors` score zero.
    pub fn score_pair(&self, a: &DescriptorSet, b: &DescriptorSet) -> u32 {
        if a.is_empty()
            || b.is_empty()
            || a.len() < self.config.min_descriptors
            || b.len() < self.config.min_descriptors
        {
            return 0;
        }

        let forward = Self::nearest(a.as_slice(), b.as_slice());
        let backward = Self::nearest(b.as_slice(), a.as_slice());

        forward
            .iter()
            .enumerate()
            .filter(|&(i, &(j, dist))| backward[j].0 == i && dist <= self.config.max_distance)
            .count() as u32
    }

    /// Score of a template against the best of the probe's rotation variants.
    pub fn score_template(&self, probes: &[DescriptorSet], template: &DescriptorSet) -> u32 {
        probes
            .iter()
            .map(|p| self.score_pair(p, template))
            .max()
            .unwrap_or(0)
    }

    /// Scan every template. An identity's score is that of its best
    /// template; the first strictly greater score wins across the gallery.
    pub fn identify(&self, probes: &[DescriptorSet], gallery: &[GalleryEntry]) -> Identification {
        let mut best = Identification::none();
        for entry in gallery {
            let score = self.score_template(probes, &entry.template.descriptors);
            if score > best.score {
                best = Identification {
                    identity_id: Some(entry.identity_id.clone()),
                    display_name: Some(entry.display_name.clone()),
                    score,
                };
            }
        }
        tracing::debug!(
            "Best match {:?} with score {} over {} templates",
            best.identity_id,
            best.score,
            gallery.len()
        );
        best
    }

    /// Full template-by-template score table, used by the report command.
    pub fn score_matrix(&self, gallery: &[GalleryEntry]) -> Vec<Vec<u32>> {
        gallery
            .iter()
            .map(|a| {
                gallery
                    .iter()
                    .map(|b| self.score_pair(&a.template.descriptors, &b.template.descriptors))
                    .collect()
            })
            .collect()
    }
}
