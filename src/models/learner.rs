use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{Adam, AdamConfig, GradientsAccumulator, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use tracing::{debug, info};

use crate::data::{encode_bag, BagItem};
use crate::error::{CheckpointError, FitError};
use crate::models::init::{init_weights, WeightInit};
use crate::models::registry::{ModelContext, ModelFamily};
use crate::models::{MilNetwork, MilOutput, TrainableModel};

type WeightRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

/// Wraps a network with its optimizer and gradient accumulator.
///
/// Any [`MilNetwork`] becomes a [`TrainableModel`] this way, so the trainer
/// never sees a concrete family type.
pub struct Learner<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + MilNetwork<B>,
{
    family: ModelFamily,
    network: M,
    optimizer_config: AdamConfig,
    optimizer: OptimizerAdaptor<Adam, M, B>,
    accumulator: GradientsAccumulator<M>,
    pending: usize,
    instance_loss: bool,
    learning_rate: f64,
    hyperparameters: serde_json::Value,
    device: B::Device,
}

impl<B, M> Learner<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + MilNetwork<B>,
    M::InnerModule: MilNetwork<B::InnerBackend>,
{
    pub fn new(
        family: ModelFamily,
        network: M,
        learning_rate: f64,
        weight_decay: f64,
        hyperparameters: serde_json::Value,
        device: &B::Device,
    ) -> Self {
        let weight_decay = (weight_decay > 0.0).then(|| WeightDecayConfig::new(weight_decay as f32));
        let optimizer_config = AdamConfig::new().with_weight_decay(weight_decay);
        let optimizer = optimizer_config.init();
        Learner {
            family,
            network,
            optimizer_config,
            optimizer,
            accumulator: GradientsAccumulator::new(),
            pending: 0,
            instance_loss: true,
            learning_rate,
            hyperparameters,
            device: device.clone(),
        }
    }

    /// The wrapped network.
    pub fn network(&self) -> &M {
        &self.network
    }
}

impl<B, M> TrainableModel<B> for Learner<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + MilNetwork<B>,
    M::InnerModule: MilNetwork<B::InnerBackend>,
{
    fn family(&self) -> ModelFamily {
        self.family
    }

    fn forward(&self, bag: &BagItem) -> MilOutput<B> {
        let features = encode_bag::<B>(bag, &self.device);
        let output = self.network.forward(features, Some(bag.label));
        if self.instance_loss {
            output
        } else {
            MilOutput::bag(output.logits)
        }
    }

    fn predict(&self, bags: &[&BagItem]) -> Result<Vec<Vec<f32>>, FitError> {
        let model = self.network.valid();
        bags.iter()
            .map(|bag| {
                let features = encode_bag::<B::InnerBackend>(bag, &self.device);
                let output = model.forward(features, None);
                output
                    .logits
                    .into_data()
                    .convert::<f32>()
                    .to_vec::<f32>()
                    .map_err(|e| FitError::Runtime(format!("reading logits of {}: {e:?}", bag.name)))
            })
            .collect()
    }

    fn backward(&mut self, loss: Tensor<B, 1>) {
        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.network);
        self.accumulator.accumulate(&self.network, grads);
        self.pending += 1;
    }

    fn step(&mut self) -> bool {
        if self.pending == 0 {
            return false;
        }
        let grads = self.accumulator.grads();
        self.network = self
            .optimizer
            .step(self.learning_rate, self.network.clone(), grads);
        self.pending = 0;
        true
    }

    fn num_params(&self) -> usize {
        self.network.num_params()
    }

    fn hyperparameters(&self) -> serde_json::Value {
        self.hyperparameters.clone()
    }

    fn state_dict(&self) -> Result<Vec<u8>, CheckpointError> {
        let recorder = WeightRecorder::default();
        <WeightRecorder as Recorder<B>>::record(&recorder, self.network.clone().into_record(), ())
            .map_err(|e| CheckpointError::RecordEncode(format!("{e:?}")))
    }

    fn load_state_dict(&mut self, bytes: Vec<u8>) -> Result<(), CheckpointError> {
        let recorder = WeightRecorder::default();
        let record = <WeightRecorder as Recorder<B>>::load::<M::Record>(&recorder, bytes, &self.device)
            .map_err(|e| CheckpointError::RecordDecode(format!("{e:?}")))?;
        self.network = self.network.clone().load_record(record);
        Ok(())
    }

    fn optimizer_state(&self) -> Result<Vec<u8>, CheckpointError> {
        let recorder = WeightRecorder::default();
        <WeightRecorder as Recorder<B>>::record(&recorder, self.optimizer.to_record(), ())
            .map_err(|e| CheckpointError::RecordEncode(format!("{e:?}")))
    }

    fn load_optimizer_state(&mut self, bytes: Vec<u8>) -> Result<(), CheckpointError> {
        let recorder = WeightRecorder::default();
        let record = <WeightRecorder as Recorder<B>>::load::<
            <OptimizerAdaptor<Adam, M, B> as Optimizer<M, B>>::Record,
        >(&recorder, bytes, &self.device)
        .map_err(|e| CheckpointError::RecordDecode(format!("{e:?}")))?;
        self.optimizer = self.optimizer_config.init().load_record(record);
        self.accumulator = GradientsAccumulator::new();
        self.pending = 0;
        Ok(())
    }

    fn initialize(&mut self, init: WeightInit) {
        let (network, redrawn) = init_weights(self.network.clone(), init);
        self.network = network;
        debug!(family = %self.family, ?init, redrawn, "initialised weights");
    }

    fn set_instance_loss(&mut self, enabled: bool) {
        self.instance_loss = enabled;
    }

    fn compile(&mut self, ctx: &ModelContext) {
        // Inference module: dropout is inactive, so no randomness is drawn.
        let model = self.network.valid();
        let features = (0..ctx.n_columns.max(1))
            .map(|_| Tensor::<B::InnerBackend, 2>::zeros([4, ctx.feature_size], &self.device))
            .collect();
        let output = model.forward(features, None);
        let [_, n_classes] = output.logits.dims();
        info!(family = %self.family, n_classes, "compiled model with warm-up pass");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FeatureMatrix;
    use crate::models::networks::AdmilConfig;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray>;

    fn ctx() -> ModelContext {
        ModelContext {
            n_classes: 2,
            feature_size: 6,
            n_columns: 1,
            multires: None,
        }
    }

    fn bag(label: usize, value: f32) -> BagItem {
        BagItem {
            name: format!("bag_{label}"),
            label,
            features: vec![FeatureMatrix {
                rows: 3,
                cols: 6,
                values: vec![value; 18],
            }],
        }
    }

    fn learner() -> Learner<TestBackend, crate::models::networks::Admil<TestBackend>> {
        let device = Default::default();
        let config = AdmilConfig {
            size: 8,
            attention_size: 4,
            dropout: 0.0,
            ..AdmilConfig::default()
        };
        let network = config.init::<TestBackend>(&ctx(), &device);
        Learner::new(
            ModelFamily::Admil,
            network,
            1e-2,
            0.0,
            serde_json::json!({}),
            &device,
        )
    }

    fn first_logits(learner: &Learner<TestBackend, crate::models::networks::Admil<TestBackend>>) -> Vec<f32> {
        let b = bag(1, 0.5);
        learner.predict(&[&b]).unwrap().remove(0)
    }

    #[test]
    fn test_step_without_backward_is_noop() {
        let mut learner = learner();
        assert!(!learner.step());
    }

    #[test]
    fn test_backward_and_step_change_weights() {
        let mut learner = learner();
        let before = first_logits(&learner);

        let b = bag(1, 0.5);
        let output = learner.forward(&b);
        let loss = output.logits.sum().reshape([1]);
        learner.backward(loss);
        assert!(learner.step());

        let after = first_logits(&learner);
        assert_ne!(before, after);
    }

    #[test]
    fn test_state_dict_roundtrip() {
        let mut source = learner();
        source.initialize(WeightInit::XavierNormal);
        let bytes = source.state_dict().unwrap();

        let mut target = learner();
        target.load_state_dict(bytes).unwrap();
        assert_eq!(first_logits(&source), first_logits(&target));
    }

    fn train_once(learner: &mut Learner<TestBackend, crate::models::networks::Admil<TestBackend>>) {
        let b = bag(1, 0.5);
        let output = learner.forward(&b);
        learner.backward(output.logits.sum().reshape([1]));
        assert!(learner.step());
    }

    #[test]
    fn test_optimizer_state_carries_adam_moments() {
        let mut continuous = learner();
        train_once(&mut continuous);
        let weights = continuous.state_dict().unwrap();
        let optimizer = continuous.optimizer_state().unwrap();
        train_once(&mut continuous);

        let mut restored = learner();
        restored.load_state_dict(weights.clone()).unwrap();
        restored.load_optimizer_state(optimizer).unwrap();
        train_once(&mut restored);

        let mut cold = learner();
        cold.load_state_dict(weights).unwrap();
        train_once(&mut cold);

        let expected = first_logits(&continuous);
        let resumed = first_logits(&restored);
        assert!(expected.iter().zip(&resumed).all(|(a, b)| (a - b).abs() < 1e-6));
        assert_ne!(expected, first_logits(&cold));
    }

    #[test]
    fn test_load_garbage_optimizer_state_fails() {
        let mut target = learner();
        let err = target.load_optimizer_state(vec![7; 4]).unwrap_err();
        assert!(matches!(err, CheckpointError::RecordDecode(_)));
    }

    #[test]
    fn test_load_garbage_state_dict_fails() {
        let mut target = learner();
        let err = target.load_state_dict(vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, CheckpointError::RecordDecode(_)));
    }

    #[test]
    fn test_compile_keeps_weights() {
        let mut learner = learner();
        let before = first_logits(&learner);
        learner.compile(&ctx());
        assert_eq!(before, first_logits(&learner));
    }

    #[test]
    fn test_predict_shape() {
        let learner = learner();
        let a = bag(0, 0.1);
        let b = bag(1, 0.9);
        let logits = learner.predict(&[&a, &b]).unwrap();
        assert_eq!(logits.len(), 2);
        assert!(logits.iter().all(|l| l.len() == 2));
        assert!(learner.num_params() > 0);
    }
}
