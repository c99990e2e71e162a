//! Typed builder for the `p_next` extension chain handed to instance creation.
//!
//! The chain is a compile-time-checked list of supported extension structs;
//! [`ExtensionChain::head`] threads them into the single forward-linked chain
//! the API expects.

use ash::vk;
use std::ffi::c_void;

/// One instance-creation extension struct the chain knows how to link.
pub enum InstanceExtension {
    /// `VK_EXT_validation_features` feature toggles.
    ValidationFeatures {
        enables: Vec<vk::ValidationFeatureEnableEXT>,
        raw: vk::ValidationFeaturesEXT,
    },
}

impl InstanceExtension {
    pub fn validation_features(enables: Vec<vk::ValidationFeatureEnableEXT>) -> Self {
        Self::ValidationFeatures {
            enables,
            raw: vk::ValidationFeaturesEXT::default(),
        }
    }
}

/// Zero or more optional feature-toggle structs chained before instance
/// creation.
#[derive(Default)]
pub struct ExtensionChain {
    links: Vec<InstanceExtension>,
}

impl ExtensionChain {
    pub fn push(mut self, extension: InstanceExtension) -> Self {
        self.links.push(extension);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Links every contained struct through its `p_next` pointer and returns
    /// the head of the chain, or null when the chain is empty.
    ///
    /// The returned pointer borrows from `self`: the chain must stay alive
    /// and unmodified until the creation call consuming it has returned.
    pub fn head(&mut self) -> *const c_void {
        let mut next: *const c_void = std::ptr::null();
        for link in self.links.iter_mut().rev() {
            next = match link {
                InstanceExtension::ValidationFeatures { enables, raw } => {
                    raw.enabled_validation_feature_count = enables.len() as u32;
                    raw.p_enabled_validation_features = enables.as_ptr();
                    raw.p_next = next;
                    raw as *const vk::ValidationFeaturesEXT as *const c_void
                }
            };
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_chain_has_null_head() {
        let mut chain = ExtensionChain::default();
        assert!(chain.is_empty());
        assert!(chain.head().is_null());
    }

    #[test]
    fn head_points_at_first_link() {
        let mut chain = ExtensionChain::default().push(InstanceExtension::validation_features(
            vec![vk::ValidationFeatureEnableEXT::BEST_PRACTICES],
        ));

        let head = chain.head();
        assert!(!head.is_null());

        let base = unsafe { &*(head as *const vk::BaseInStructure) };
        assert_eq!(base.s_type, vk::StructureType::VALIDATION_FEATURES_EXT);
        assert!(base.p_next.is_null());
    }

    #[test]
    fn links_are_threaded_in_push_order() {
        let mut chain = ExtensionChain::default()
            .push(InstanceExtension::validation_features(vec![
                vk::ValidationFeatureEnableEXT::GPU_ASSISTED,
            ]))
            .push(InstanceExtension::validation_features(vec![
                vk::ValidationFeatureEnableEXT::SYNCHRONIZATION_VALIDATION,
                vk::ValidationFeatureEnableEXT::BEST_PRACTICES,
            ]));

        let head = chain.head();
        let first = unsafe { &*(head as *const vk::ValidationFeaturesEXT) };
        assert_eq!(first.enabled_validation_feature_count, 1);
        assert!(!first.p_next.is_null());

        let second = unsafe { &*(first.p_next as *const vk::ValidationFeaturesEXT) };
        assert_eq!(second.enabled_validation_feature_count, 2);
        assert!(second.p_next.is_null());
    }
}
