//! ONNX Runtime backed activity classifier.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use log::info;
use ndarray::Array3;
use ort::{inputs, session::Session, value::Tensor};

use super::{
    classifier::{ActivityLabel, Classifier},
    window::WindowTensor,
};

/// Model with one float input shaped `(1, 6, timesteps)` and one output of six class scores.
pub struct OnnxClassifier {
    session: Session,
    input_name: String,
    output_name: String,
}

impl OnnxClassifier {
    pub fn load(model_path: &Path) -> Result<Self> {
        let session = Session::builder()
            .map_err(|e| anyhow!("failed to create session builder: {e}"))?
            .commit_from_file(model_path)
            .map_err(|e| anyhow!("failed to load model {}: {e}", model_path.display()))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| anyhow!("model {} declares no inputs", model_path.display()))?;
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| anyhow!("model {} declares no outputs", model_path.display()))?;

        info!(
            "Loaded activity model {} (input '{}', output '{}')",
            model_path.display(),
            input_name,
            output_name
        );

        Ok(Self {
            session,
            input_name,
            output_name,
        })
    }
}

impl Classifier for OnnxClassifier {
    fn predict(&mut self, input: &WindowTensor) -> Result<Vec<f32>> {
        let [batch, channels, timesteps] = input.shape();
        let array = Array3::from_shape_vec((batch, channels, timesteps), input.as_slice().to_vec())
            .context("failed to shape model input")?;
        let tensor =
            Tensor::from_array(array).map_err(|e| anyhow!("failed to create input tensor: {e}"))?;

        let outputs = self
            .session
            .run(inputs![self.input_name.as_str() => tensor])
            .map_err(|e| anyhow!("failed to run inference: {e}"))?;

        let scores: Vec<f32> = outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| anyhow!("failed to extract scores: {e}"))?
            .iter()
            .copied()
            .collect();

        if scores.len() != ActivityLabel::ALL.len() {
            return Err(anyhow!(
                "model produced {} scores, expected {}",
                scores.len(),
                ActivityLabel::ALL.len()
            ));
        }
        Ok(scores)
    }
}
