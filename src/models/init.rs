use burn::module::{ModuleMapper, ParamId};
use burn::prelude::*;
use burn::tensor::Distribution;

/// Weight initialisation schemes selectable with `model.initializer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightInit {
    XavierUniform,
    XavierNormal,
    KaimingUniform,
    KaimingNormal,
    /// Normal with standard deviation 0.02.
    Normal,
}

impl WeightInit {
    fn distribution(&self, fan_in: usize, fan_out: usize) -> Distribution {
        let fan_in = fan_in.max(1) as f64;
        let fan_out = fan_out.max(1) as f64;
        match self {
            WeightInit::XavierUniform => {
                let a = (6.0 / (fan_in + fan_out)).sqrt();
                Distribution::Uniform(-a, a)
            }
            WeightInit::XavierNormal => Distribution::Normal(0.0, (2.0 / (fan_in + fan_out)).sqrt()),
            WeightInit::KaimingUniform => {
                let a = (6.0 / fan_in).sqrt();
                Distribution::Uniform(-a, a)
            }
            WeightInit::KaimingNormal => Distribution::Normal(0.0, (2.0 / fan_in).sqrt()),
            WeightInit::Normal => Distribution::Normal(0.0, 0.02),
        }
    }
}

/// Redraws every parameter of rank 2 or more. Rank-1 parameters (biases,
/// norm scales and offsets) keep their values.
struct WeightInitializer {
    init: WeightInit,
    redrawn: usize,
}

impl<B: Backend> ModuleMapper<B> for WeightInitializer {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        if D < 2 {
            return tensor;
        }
        // Linear weights are stored [in, out].
        let dims = tensor.dims();
        let fan_in = dims[0];
        let fan_out: usize = dims[1..].iter().product();
        let require_grad = tensor.is_require_grad();
        let fresh = Tensor::<B, D>::random(
            tensor.shape(),
            self.init.distribution(fan_in, fan_out),
            &tensor.device(),
        );
        self.redrawn += 1;
        fresh.set_require_grad(require_grad)
    }
}

/// Apply `init` to a module, returning the module and the number of
/// parameter tensors that were redrawn.
pub fn init_weights<B: Backend, M: Module<B>>(module: M, init: WeightInit) -> (M, usize) {
    let mut mapper = WeightInitializer { init, redrawn: 0 };
    let module = module.map(&mut mapper);
    (module, mapper.redrawn)
}
