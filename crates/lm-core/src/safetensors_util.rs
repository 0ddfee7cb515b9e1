use anyhow::{bail, Context, Result};
use memmap2::MmapOptions;
use safetensors::tensor::{Dtype, View};
use safetensors::SafeTensors;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tch::{nn, Device, Kind, Tensor};

/// Outcome of copying a safetensors file into a VarStore.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    /// Tensors present in the file with no matching variable.
    pub unexpected: Vec<String>,
}

impl LoadReport {
    fn merge(&mut self, other: LoadReport) {
        self.loaded += other.loaded;
        self.unexpected.extend(other.unexpected);
    }
}

pub fn load_safetensors<P: AsRef<Path>>(vs: &mut nn::VarStore, path: P) -> Result<LoadReport> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut variables = vs.variables();
    let device = vs.device();
    let mut report = LoadReport::default();

    for (name, view) in tensors.tensors() {
        let Some(var) = variables.get_mut(&name) else {
            log::debug!("Tensor {} found in safetensors but not in model", name);
            report.unexpected.push(name);
            continue;
        };

        let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
        if shape != var.size() {
            bail!("Shape mismatch for {}: file {:?}, model {:?}", name, shape, var.size());
        }
        let kind = match view.dtype() {
            Dtype::F32 => Kind::Float,
            Dtype::F16 => Kind::Half,
            Dtype::BF16 => Kind::BFloat16,
            other => bail!("Unsupported dtype {:?} for {}", other, name),
        };

        let src = Tensor::from_data_size(view.data(), &shape, kind).to_device(device);
        tch::no_grad(|| {
            var.copy_(&src);
        });
        report.loaded += 1;
    }

    log::info!("Loaded {} tensors from {:?}", report.loaded, path);
    Ok(report)
}

/// Load every `*.safetensors` file in `dir` (sharded checkpoints), in name order.
pub fn load_safetensors_dir<P: AsRef<Path>>(vs: &mut nn::VarStore, dir: P) -> Result<LoadReport> {
    let dir = dir.as_ref();
    let mut shards: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read model directory {:?}", dir))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map_or(false, |ext| ext == "safetensors"))
        .collect();
    shards.sort();

    if shards.is_empty() {
        bail!("No .safetensors weights in {:?}", dir);
    }

    let mut report = LoadReport::default();
    for shard in shards {
        report.merge(load_safetensors(vs, &shard)?);
    }
    Ok(report)
}

/// Host copy of one tensor in f32, ready for serialization.
struct F32View {
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl F32View {
    fn from_tensor(t: &Tensor) -> Result<Self> {
        let flat = t.to_device(Device::Cpu).to_kind(Kind::Float).contiguous().reshape([-1]);
        let values = Vec::<f32>::try_from(&flat)?;
        Ok(Self {
            shape: t.size().iter().map(|&d| d as usize).collect(),
            bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        })
    }
}

impl View for F32View {
    fn dtype(&self) -> Dtype {
        Dtype::F32
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<[u8]> {
        Cow::Borrowed(&self.bytes)
    }

    fn data_len(&self) -> usize {
        self.bytes.len()
    }
}

/// Write the variables whose names pass `keep` to a safetensors file, with
/// optional string metadata in the header. Returns the number written.
pub fn save_safetensors<P, F>(
    vs: &nn::VarStore,
    path: P,
    keep: F,
    metadata: Option<HashMap<String, String>>,
) -> Result<usize>
where
    P: AsRef<Path>,
    F: Fn(&str) -> bool,
{
    let mut views = Vec::new();
    let mut names: Vec<(String, Tensor)> = vs.variables().into_iter().filter(|(n, _)| keep(n)).collect();
    names.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, tensor) in &names {
        views.push((name.clone(), F32View::from_tensor(tensor)?));
    }

    let count = views.len();
    safetensors::serialize_to_file(views, &metadata, path.as_ref())
        .with_context(|| format!("Failed to write {:?}", path.as_ref()))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filtered_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter_model.safetensors");

        let src = nn::VarStore::new(Device::Cpu);
        let a = (src.root() / "layer").var("lora_A", &[2, 3], nn::Init::Randn { mean: 0.0, stdev: 1.0 });
        let _frozen = (src.root() / "layer").zeros_no_train("weight", &[3, 3]);
        let n = save_safetensors(&src, &path, |name| name.contains("lora_"), None).unwrap();
        assert_eq!(n, 1);

        let mut dst = nn::VarStore::new(Device::Cpu);
        let b = (dst.root() / "layer").var("lora_A", &[2, 3], nn::Init::Const(0.0));
        let report = load_safetensors(&mut dst, &path).unwrap();
        assert_eq!(report.loaded, 1);
        assert!(report.unexpected.is_empty());
        assert!(a.allclose(&b, 1e-6, 1e-6, false));
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");

        let src = nn::VarStore::new(Device::Cpu);
        let _ = src.root().var("w", &[4], nn::Init::Const(1.0));
        save_safetensors(&src, &path, |_| true, None).unwrap();

        let mut dst = nn::VarStore::new(Device::Cpu);
        let _ = dst.root().var("w", &[5], nn::Init::Const(0.0));
        assert!(load_safetensors(&mut dst, &path).is_err());
    }
}
