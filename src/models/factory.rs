use std::path::{Path, PathBuf};

use burn::tensor::backend::AutodiffBackend;
use tracing::{info, warn};

use crate::checkpoint::read_checkpoint;
use crate::config::RunConfig;
use crate::error::ModelError;
use crate::models::registry::{ModelContext, ModelRegistry};
use crate::models::TrainableModel;

/// Substitute fold and run into a checkpoint template under `root`.
pub fn pretrained_checkpoint_path(root: &Path, template: &str, fold: usize, run: usize) -> PathBuf {
    root.join(
        template
            .replace("{fold}", &fold.to_string())
            .replace("{run}", &run.to_string()),
    )
}

/// Builds ready-to-train models from the run configuration.
pub struct ModelFactory<'a, B: AutodiffBackend> {
    registry: &'a ModelRegistry<B>,
    device: B::Device,
}

impl<'a, B: AutodiffBackend> ModelFactory<'a, B> {
    pub fn new(registry: &'a ModelRegistry<B>, device: B::Device) -> Self {
        ModelFactory { registry, device }
    }

    /// Resolve the configured family and construct it.
    ///
    /// With `model.checkpoint` set, `fold` and `run` are required and the
    /// weights are loaded from the family's checkpoint template under that
    /// root. No file is read otherwise.
    pub fn build(
        &self,
        config: &RunConfig,
        compile: bool,
        fold: Option<usize>,
        run: Option<usize>,
    ) -> Result<Box<dyn TrainableModel<B>>, ModelError> {
        let descriptor = self.registry.resolve(&config.model.classifier)?;

        let checkpoint = match (&config.model.checkpoint, fold, run) {
            (None, _, _) => None,
            (Some(root), Some(fold), Some(run)) => Some(pretrained_checkpoint_path(
                root,
                descriptor.checkpoint_template,
                fold,
                run,
            )),
            (Some(_), fold, run) => return Err(ModelError::MissingCheckpointIndices { fold, run }),
        };

        let ctx = ModelContext::from_config(config);
        let mut model = (descriptor.build)(&config.model, &ctx, &self.device);
        model.set_instance_loss(descriptor.supports_instance_loss);

        if let Some(path) = &checkpoint {
            let (header, weights) = read_checkpoint(path)?;
            if header.family != descriptor.family.id() {
                return Err(ModelError::FamilyMismatch {
                    path: path.clone(),
                    expected: descriptor.family.id().to_string(),
                    found: header.family,
                });
            }
            model.load_state_dict(weights)?;
            info!(
                path = %path.display(),
                epoch = header.progress.epoch,
                "loaded pretrained weights"
            );
        }

        if compile {
            model.compile(&ctx);
        }

        if let Some(init) = config.model.initializer {
            if checkpoint.is_some() {
                warn!(?init, "initializer overwrites the pretrained weights");
            }
            model.initialize(init);
        }

        info!(
            family = %descriptor.family,
            params = model.num_params(),
            instance_loss = descriptor.supports_instance_loss,
            "built model"
        );
        Ok(model)
    }
}
