use crate::common::config::ExtractorConfig;
use crate::common::{FingertimeError, Result};
use crate::core::orb::{self, OrbParams};
use crate::core::preprocess;
use crate::sensor::Frame;
use image::GrayImage;

pub use crate::core::orb::{Descriptor, Keypoint, DESCRIPTOR_BYTES};

/// Ordered binary descriptors from one image. Order carries no meaning but
/// is preserved through serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorSet {
    descriptors: Vec<Descriptor>,
}

impl DescriptorSet {
    pub fn new(descriptors: Vec<Descriptor>) -> Self {
        Self { descriptors }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Descriptor> {
        self.descriptors.iter()
    }

    pub fn as_slice(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// Concatenated descriptor bytes, 32 per descriptor.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.descriptors.iter().flatten().copied().collect()
    }

    /// Inverse of [`to_bytes`](Self::to_bytes). An empty blob is an empty set.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % DESCRIPTOR_BYTES != 0 {
            return Err(FingertimeError::MalformedTemplate {
                len: bytes.len(),
                width: DESCRIPTOR_BYTES,
            });
        }
        let descriptors = bytes
            .chunks_exact(DESCRIPTOR_BYTES)
            .map(|chunk| {
                let mut d = [0u8; DESCRIPTOR_BYTES];
                d.copy_from_slice(chunk);
                d
            })
            .collect();
        Ok(Self { descriptors })
    }
}

impl<'a> IntoIterator for &'a DescriptorSet {
    type Item = &'a Descriptor;
    type IntoIter = std::slice::Iter<'a, Descriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.descriptors.iter()
    }
}

/// Turns sensor frames into descriptor sets.
///
/// Enrollment and identification both go through [`extract`](Self::extract)
/// or [`extract_rotations`](Self::extract_rotations), so templates and
/// probes always share the same enhancement chain.
pub struct DescriptorExtractor {
    config: ExtractorConfig,
    params: OrbParams,
}

impl DescriptorExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        let params = OrbParams::from(&config);
        Self { config, params }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Crop and enhance a raw frame.
    pub fn preprocess(&self, frame: &Frame) -> GrayImage {
        preprocess::enhance(frame.image(), &self.config)
    }

    /// Descriptors of the unrotated, enhanced frame. May be empty.
    pub fn extract(&self, frame: &Frame) -> DescriptorSet {
        let enhanced = self.preprocess(frame);
        self.describe(&enhanced)
    }

    pub fn extract_with_keypoints(&self, frame: &Frame) -> (Vec<Keypoint>, DescriptorSet) {
        let enhanced = self.preprocess(frame);
        let (keypoints, descriptors) = orb::detect_and_compute(&enhanced, &self.params);
        (keypoints, DescriptorSet::new(descriptors))
    }

    /// One descriptor set per configured rotation angle, in config order.
    pub fn extract_rotations(&self, frame: &Frame) -> Vec<DescriptorSet> {
        let enhanced = self.preprocess(frame);
        self.config
            .rotation_angles
            .iter()
            .map(|&deg| self.describe(&preprocess::rotate(&enhanced, deg)))
            .collect()
    }

    fn describe(&self, image: &GrayImage) -> DescriptorSet {
        let (_, descriptors) = orb::detect_and_compute(image, &self.params);
        DescriptorSet::new(descriptors)
    }
}
