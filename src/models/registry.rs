use std::collections::HashMap;
use std::fmt;

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::config::{ModelConfig, RunConfig};
use crate::error::ModelError;
use crate::models::multires::MultiresSpec;
use crate::models::networks;
use crate::models::TrainableModel;

/// Where a pretrained model lives relative to the experiment root.
pub const DEFAULT_CHECKPOINT_TEMPLATE: &str = "{fold}_fold/checkpoints/version_{run}/final.ckpt";

/// The closed set of supported architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    Clam,
    TransMil,
    Admil,
    Dsmil,
    Mil,
    Mamil,
    Minet,
    Dtfd,
    Csmil,
    Mmil,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 10] = [
        ModelFamily::Clam,
        ModelFamily::TransMil,
        ModelFamily::Admil,
        ModelFamily::Dsmil,
        ModelFamily::Mil,
        ModelFamily::Mamil,
        ModelFamily::Minet,
        ModelFamily::Dtfd,
        ModelFamily::Csmil,
        ModelFamily::Mmil,
    ];

    /// Identifier used in configuration files and checkpoint headers.
    pub fn id(&self) -> &'static str {
        match self {
            ModelFamily::Clam => "clam",
            ModelFamily::TransMil => "transmil",
            ModelFamily::Admil => "admil",
            ModelFamily::Dsmil => "dsmil",
            ModelFamily::Mil => "mil",
            ModelFamily::Mamil => "mamil",
            ModelFamily::Minet => "minet",
            ModelFamily::Dtfd => "dtfd",
            ModelFamily::Csmil => "csmil",
            ModelFamily::Mmil => "mmil",
        }
    }

    /// Parse a configured identifier. Any identifier mentioning `minet`
    /// selects the MI-Net family.
    pub fn parse(identifier: &str) -> Option<ModelFamily> {
        ModelFamily::ALL
            .into_iter()
            .find(|family| family.id() == identifier)
            .or_else(|| identifier.contains("minet").then_some(ModelFamily::Minet))
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Values every family constructor needs besides its own parameter block.
#[derive(Debug, Clone)]
pub struct ModelContext {
    pub n_classes: usize,
    pub feature_size: usize,
    /// Number of feature columns each bag carries.
    pub n_columns: usize,
    /// Resolved once per run and handed to every family.
    pub multires: Option<MultiresSpec>,
}

impl ModelContext {
    pub fn from_config(config: &RunConfig) -> Self {
        ModelContext {
            n_classes: config.dataset.num_classes,
            feature_size: config.dataset.feature_size,
            n_columns: config.dataset.data_cols.len(),
            multires: config
                .multires_aggregation
                .resolve(&config.dataset.data_cols),
        }
    }

    /// Width of the instance features after multi-resolution aggregation.
    pub fn input_size(&self) -> usize {
        self.multires
            .as_ref()
            .map_or(self.feature_size, |spec| spec.output_size(self.feature_size))
    }
}

/// Builds a fresh model of one family from the model configuration.
pub type BuildFn<B> =
    fn(&ModelConfig, &ModelContext, &<B as Backend>::Device) -> Box<dyn TrainableModel<B>>;

/// Everything the factory needs to know about one family.
pub struct FamilyDescriptor<B: AutodiffBackend> {
    pub family: ModelFamily,
    /// Whether the family can add an instance-level auxiliary loss.
    pub supports_instance_loss: bool,
    /// Relative path of a pretrained checkpoint; `{fold}` and `{run}` are
    /// substituted.
    pub checkpoint_template: &'static str,
    pub build: BuildFn<B>,
}

impl<B: AutodiffBackend> Clone for FamilyDescriptor<B> {
    fn clone(&self) -> Self {
        FamilyDescriptor {
            family: self.family,
            supports_instance_loss: self.supports_instance_loss,
            checkpoint_template: self.checkpoint_template,
            build: self.build,
        }
    }
}

impl<B: AutodiffBackend> fmt::Debug for FamilyDescriptor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FamilyDescriptor")
            .field("family", &self.family)
            .field("supports_instance_loss", &self.supports_instance_loss)
            .field("checkpoint_template", &self.checkpoint_template)
            .finish()
    }
}

/// Maps family identifiers to their descriptors.
pub struct ModelRegistry<B: AutodiffBackend> {
    families: HashMap<&'static str, FamilyDescriptor<B>>,
}

impl<B: AutodiffBackend> ModelRegistry<B> {
    /// An empty registry.
    pub fn new() -> Self {
        ModelRegistry {
            families: HashMap::new(),
        }
    }

    /// A registry with every built-in family.
    pub fn with_default_families() -> Self {
        let mut registry = Self::new();
        for family in ModelFamily::ALL {
            registry.register(FamilyDescriptor {
                family,
                supports_instance_loss: matches!(
                    family,
                    ModelFamily::Clam | ModelFamily::Dsmil | ModelFamily::Dtfd
                ),
                checkpoint_template: DEFAULT_CHECKPOINT_TEMPLATE,
                build: default_builder::<B>(family),
            });
        }
        registry
    }

    /// Register (or replace) a family.
    pub fn register(&mut self, descriptor: FamilyDescriptor<B>) {
        self.families.insert(descriptor.family.id(), descriptor);
    }

    /// Look up the descriptor for a configured identifier.
    pub fn resolve(&self, identifier: &str) -> Result<&FamilyDescriptor<B>, ModelError> {
        ModelFamily::parse(identifier)
            .and_then(|family| self.families.get(family.id()))
            .ok_or_else(|| ModelError::UnknownFamily(identifier.to_string()))
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }
}

impl<B: AutodiffBackend> Default for ModelRegistry<B> {
    fn default() -> Self {
        Self::with_default_families()
    }
}

fn default_builder<B: AutodiffBackend>(family: ModelFamily) -> BuildFn<B> {
    match family {
        ModelFamily::Clam => networks::clam::build::<B>,
        ModelFamily::TransMil => networks::transmil::build::<B>,
        ModelFamily::Admil => networks::admil::build::<B>,
        ModelFamily::Dsmil => networks::dsmil::build::<B>,
        ModelFamily::Mil => networks::mil::build::<B>,
        ModelFamily::Mamil => networks::mamil::build::<B>,
        ModelFamily::Minet => networks::minet::build::<B>,
        ModelFamily::Dtfd => networks::dtfd::build::<B>,
        ModelFamily::Csmil => networks::csmil::build::<B>,
        ModelFamily::Mmil => networks::mmil::build::<B>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray>;

    #[test]
    fn test_parse_known_identifiers() {
        for family in ModelFamily::ALL {
            assert_eq!(ModelFamily::parse(family.id()), Some(family));
        }
    }

    #[test]
    fn test_parse_minet_alias() {
        assert_eq!(ModelFamily::parse("mi_minet"), Some(ModelFamily::Minet));
        assert_eq!(ModelFamily::parse("not-a-real-model"), None);
        assert_eq!(ModelFamily::parse("CLAM"), None);
    }

    #[test]
    fn test_default_registry_has_every_family() {
        let registry = ModelRegistry::<TestBackend>::with_default_families();
        assert_eq!(registry.len(), ModelFamily::ALL.len());
        for family in ModelFamily::ALL {
            let descriptor = registry.resolve(family.id()).unwrap();
            assert_eq!(descriptor.family, family);
            assert_eq!(descriptor.checkpoint_template, DEFAULT_CHECKPOINT_TEMPLATE);
        }
    }

    #[test]
    fn test_instance_loss_support_flags() {
        let registry = ModelRegistry::<TestBackend>::with_default_families();
        let supported: Vec<ModelFamily> = ModelFamily::ALL
            .into_iter()
            .filter(|f| registry.resolve(f.id()).unwrap().supports_instance_loss)
            .collect();
        assert_eq!(
            supported,
            vec![ModelFamily::Clam, ModelFamily::Dsmil, ModelFamily::Dtfd]
        );
    }

    #[test]
    fn test_resolve_unknown_family() {
        let registry = ModelRegistry::<TestBackend>::with_default_families();
        let err = registry.resolve("not-a-real-model").unwrap_err();
        assert!(matches!(err, ModelError::UnknownFamily(ref id) if id == "not-a-real-model"));
    }

    #[test]
    fn test_empty_registry_rejects_known_family() {
        let registry = ModelRegistry::<TestBackend>::new();
        assert!(registry.is_empty());
        assert!(registry.resolve("admil").is_err());
    }

    #[test]
    fn test_context_input_size_with_concat() {
        let mut config = RunConfig::default();
        config.dataset.feature_size = 16;
        config.dataset.data_cols = vec!["target".to_string(), "context".to_string()];
        config.multires_aggregation.features =
            Some(vec!["target".to_string(), "context".to_string()]);
        let ctx = ModelContext::from_config(&config);
        assert_eq!(ctx.n_columns, 2);
        assert_eq!(ctx.input_size(), 32);
    }
}
