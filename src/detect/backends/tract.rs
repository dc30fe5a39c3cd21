#![cfg(feature = "backend-tract")]

//! ONNX detectors run through tract.
//!
//! The model must take a `[1, H, W, 3]` u8 image and put a `[1, 1, N, 7]`
//! f32 detection-output tensor first among its outputs.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{check_input, DetectorBackend};
use crate::detect::result::{parse_output, RawDetection};
use crate::preprocess::{InputShape, InputTensor};

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>>;

fn load_plan(path: &Path, shape: InputShape) -> Result<Plan> {
    let [batch, height, width, channels] = shape.tensor_dims();
    let image_fact = InferenceFact::dt_shape(u8::datum_type(), tvec!(batch, height, width, channels));
    tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("read ONNX model {}", path.display()))?
        .with_input_fact(0, image_fact)
        .with_context(|| format!("pin {} input of {}", shape, path.display()))?
        .into_optimized()
        .context("optimize detector graph")?
        .into_runnable()
        .context("plan detector graph")
}

pub struct TractBackend {
    plan: Plan,
    shape: InputShape,
}

impl TractBackend {
    pub fn new<P: AsRef<Path>>(model_path: P, shape: InputShape) -> Result<Self> {
        shape.validate()?;
        let path = model_path.as_ref();
        let plan = load_plan(path, shape)?;
        log::info!("TractBackend: {} ready for {} input", path.display(), shape);
        Ok(Self { plan, shape })
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn input_shape(&self) -> InputShape {
        self.shape
    }

    fn infer(&mut self, input: &InputTensor) -> Result<Vec<RawDetection>> {
        check_input(self.shape, input)?;
        let image = tract_ndarray::Array4::from_shape_vec(input.dim(), input.iter().copied().collect())
            .context("copy image into tract tensor")?;
        let outputs = self
            .plan
            .run(tvec!(image.into_tensor().into()))
            .context("run detector")?;
        let detections = outputs
            .first()
            .ok_or_else(|| anyhow!("detector returned no outputs"))?;
        let view = detections
            .to_array_view::<f32>()
            .context("detector output is not f32")?;
        let values: Vec<f32> = view.iter().copied().collect();
        parse_output(detections.shape(), &values)
    }

    /// One blank inference so graph setup cost is not billed to the first frame.
    fn warm_up(&mut self) -> Result<()> {
        let blank = InputTensor::zeros(self.shape.tensor_dims());
        self.infer(&blank).map(drop)
    }
}
