use std::fmt;
use std::str::FromStr;

use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::tensor::activation::{leaky_relu, relu};
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActivationKind {
    Relu,
    LeakyRelu,
}

impl FromStr for ActivationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relu" => Ok(ActivationKind::Relu),
            "leakyrelu" => Ok(ActivationKind::LeakyRelu),
            other => Err(Error::config(format!("unknown activation `{other}`"))),
        }
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActivationKind::Relu => "relu",
            ActivationKind::LeakyRelu => "leakyrelu",
        };
        f.write_str(name)
    }
}

#[derive(Module, Debug, Clone)]
pub struct Activation {
    kind: Ignored<ActivationKind>,
    alpha: f64,
}

impl Activation {
    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self.kind.0 {
            ActivationKind::Relu => relu(x),
            ActivationKind::LeakyRelu => leaky_relu(x, self.alpha),
        }
    }
}

#[derive(Config, Debug)]
pub struct ActivationConfig {
    kind: ActivationKind,

    /// Negative slope for leaky relu, 0.01 when unset.
    alpha: Option<f64>,
}

impl ActivationConfig {
    pub fn init(&self) -> Activation {
        Activation {
            kind: Ignored(self.kind),
            alpha: self.alpha.unwrap_or(0.01),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tensor_to_vec;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray;

    fn input() -> Tensor<TestBackend, 1> {
        Tensor::from_data(TensorData::new(vec![-2.0f32, 0.0, 3.0], [3]), &Default::default())
    }

    #[test]
    fn test_parse_activation() {
        assert_eq!("leakyrelu".parse::<ActivationKind>().unwrap(), ActivationKind::LeakyRelu);
        assert!(matches!("tanh".parse::<ActivationKind>(), Err(Error::Config(_))));
        assert!(matches!("elu".parse::<ActivationKind>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_relu_and_leaky_relu() {
        let leaky = ActivationConfig::new(ActivationKind::LeakyRelu).init();
        let out = tensor_to_vec(leaky.forward(input()));
        assert!((out[0] + 0.02).abs() < 1e-6);
        assert_eq!(out[2], 3.0);

        let steep = ActivationConfig::new(ActivationKind::LeakyRelu)
            .with_alpha(Some(0.2))
            .init();
        let out = tensor_to_vec(steep.forward(input()));
        assert!((out[0] + 0.4).abs() < 1e-6);

        let relu = ActivationConfig::new(ActivationKind::Relu).init();
        assert_eq!(tensor_to_vec(relu.forward(input())), vec![0.0, 0.0, 3.0]);
    }
}
