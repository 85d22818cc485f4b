//! Layer and model definitions plus their JSON and binary representations.
//!
//! The binary layout is little-endian throughout:
//!
//! ```text
//! i32 layer_count
//! per layer:
//!   i32 n_input_planes, i32 n_output_planes, i32 kernel_size
//!   n_output * n_input kernels (output-major), each kernel_size² f32 row-major
//!   n_output f64 biases
//! ```
//!
//! The JSON form is the array of layer objects published with the original
//! waifu2x models (`nInputPlane`, `nOutputPlane`, `kW`, `kH`, `weight`, `bias`).

use std::{
    fmt,
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use log::{debug, info};
use serde::Deserialize;
use w2x_utils::telemetry::timing_guard;

use crate::{
    error::{ConvertError, Result, STREAM_PATH, read_error},
    plane::Plane,
};

/// Kernels wider than this are rejected when reading untrusted files.
pub const MAX_KERNEL_SIZE: usize = 31;
/// Plane counts above this are rejected when reading untrusted files.
pub const MAX_FILE_PLANES: usize = 4096;

/// One convolution layer: `n_output × n_input` square kernels and one bias per output.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    n_input_planes: usize,
    n_output_planes: usize,
    kernel_size: usize,
    weights: Vec<Plane>,
    biases: Vec<f64>,
}

impl Layer {
    /// Build a layer, checking every shape invariant.
    ///
    /// `weights` is ordered output-major, input-minor: kernel `(o, i)` lives at
    /// `o * n_input_planes + i`.
    pub fn new(
        n_input_planes: usize,
        n_output_planes: usize,
        kernel_size: usize,
        weights: Vec<Plane>,
        biases: Vec<f64>,
    ) -> Result<Self> {
        if n_input_planes == 0 || n_output_planes == 0 {
            return Err(ConvertError::format(format!(
                "layer plane counts must be positive (got {n_input_planes} -> {n_output_planes})"
            )));
        }
        check_kernel_size(kernel_size)?;
        let expected = n_input_planes * n_output_planes;
        if weights.len() != expected {
            return Err(ConvertError::format(format!(
                "layer expects {expected} kernels, got {}",
                weights.len()
            )));
        }
        if let Some(index) = weights
            .iter()
            .position(|w| w.dims() != (kernel_size, kernel_size))
        {
            let (w, h) = weights[index].dims();
            return Err(ConvertError::format(format!(
                "kernel {index} is {w}x{h}, expected {kernel_size}x{kernel_size}"
            )));
        }
        if biases.len() != n_output_planes {
            return Err(ConvertError::format(format!(
                "layer expects {n_output_planes} biases, got {}",
                biases.len()
            )));
        }
        Ok(Self {
            n_input_planes,
            n_output_planes,
            kernel_size,
            weights,
            biases,
        })
    }

    pub fn n_input_planes(&self) -> usize {
        self.n_input_planes
    }

    pub fn n_output_planes(&self) -> usize {
        self.n_output_planes
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    /// Pixels of context the layer needs on each side.
    pub fn radius(&self) -> usize {
        self.kernel_size / 2
    }

    pub fn weights(&self) -> &[Plane] {
        &self.weights
    }

    /// Kernel connecting input plane `input` to output plane `output`.
    #[inline]
    pub fn weight(&self, output: usize, input: usize) -> &Plane {
        &self.weights[output * self.n_input_planes + input]
    }

    pub fn biases(&self) -> &[f64] {
        &self.biases
    }

    /// Read one binary layer record.
    pub fn read_binary<R: Read>(reader: &mut R) -> Result<Self> {
        let n_input = read_dimension(reader, "input plane count", MAX_FILE_PLANES)?;
        let n_output = read_dimension(reader, "output plane count", MAX_FILE_PLANES)?;
        let kernel_size = read_dimension(reader, "kernel size", MAX_KERNEL_SIZE)?;
        check_kernel_size(kernel_size)?;

        let taps = kernel_size * kernel_size;
        let mut raw = vec![0u8; taps * 4];
        let mut weights = Vec::with_capacity((n_input * n_output).min(1024));
        for _ in 0..n_input * n_output {
            reader
                .read_exact(&mut raw)
                .map_err(|e| read_error(e, "kernel weights"))?;
            let data = raw
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            weights.push(Plane::from_vec(kernel_size, kernel_size, data)?);
        }

        let mut raw = vec![0u8; n_output * 8];
        reader
            .read_exact(&mut raw)
            .map_err(|e| read_error(e, "biases"))?;
        let biases = raw
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect();

        Self::new(n_input, n_output, kernel_size, weights, biases)
    }

    /// Write this layer as one binary record.
    pub fn write_binary<W: Write>(&self, writer: &mut W) -> Result<()> {
        let io = |e| ConvertError::io(STREAM_PATH, e);
        for value in [self.n_input_planes, self.n_output_planes, self.kernel_size] {
            let value = i32::try_from(value)
                .map_err(|_| ConvertError::format(format!("{value} does not fit in an i32")))?;
            writer.write_all(&value.to_le_bytes()).map_err(io)?;
        }
        for kernel in &self.weights {
            for value in kernel.data() {
                writer.write_all(&value.to_le_bytes()).map_err(io)?;
            }
        }
        for bias in &self.biases {
            writer.write_all(&bias.to_le_bytes()).map_err(io)?;
        }
        Ok(())
    }

    fn from_json(raw: RawLayer, index: usize) -> Result<Self> {
        let fail = |msg: String| ConvertError::format(format!("layer {index}: {msg}"));
        if raw.kw != raw.kh {
            return Err(fail(format!(
                "kernel must be square (kW={}, kH={})",
                raw.kw, raw.kh
            )));
        }
        let kernel_size = raw.kw;
        if raw.weight.len() != raw.n_output_plane {
            return Err(fail(format!(
                "weight has {} output entries, nOutputPlane is {}",
                raw.weight.len(),
                raw.n_output_plane
            )));
        }

        let capacity = raw.weight.len().saturating_mul(raw.n_input_plane).min(1024);
        let mut weights = Vec::with_capacity(capacity);
        for (o, per_input) in raw.weight.into_iter().enumerate() {
            if per_input.len() != raw.n_input_plane {
                return Err(fail(format!(
                    "weight[{o}] has {} input entries, nInputPlane is {}",
                    per_input.len(),
                    raw.n_input_plane
                )));
            }
            for (i, rows) in per_input.into_iter().enumerate() {
                if rows.len() != kernel_size || rows.iter().any(|row| row.len() != kernel_size) {
                    return Err(fail(format!(
                        "weight[{o}][{i}] is not {kernel_size}x{kernel_size}"
                    )));
                }
                let data = rows.into_iter().flatten().map(|v| v as f32).collect();
                weights.push(Plane::from_vec(kernel_size, kernel_size, data)?);
            }
        }

        Self::new(
            raw.n_input_plane,
            raw.n_output_plane,
            kernel_size,
            weights,
            raw.bias,
        )
        .map_err(|err| match err {
            ConvertError::Format(msg) => fail(msg),
            other => other,
        })
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (min, max) = self
            .weights
            .iter()
            .flat_map(|w| w.data().iter().copied())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });
        write!(
            f,
            "{} -> {} planes, {k}x{k} kernels, weights in [{min:.4}, {max:.4}]",
            self.n_input_planes,
            self.n_output_planes,
            k = self.kernel_size
        )
    }
}

fn check_kernel_size(kernel_size: usize) -> Result<()> {
    if kernel_size == 0 || kernel_size.is_multiple_of(2) {
        return Err(ConvertError::format(format!(
            "kernel size must be odd and positive (got {kernel_size})"
        )));
    }
    Ok(())
}

fn read_i32<R: Read>(reader: &mut R, what: &str) -> Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(|e| read_error(e, what))?;
    Ok(i32::from_le_bytes(buf))
}

fn read_dimension<R: Read>(reader: &mut R, what: &str, max: usize) -> Result<usize> {
    let value = read_i32(reader, what)?;
    match usize::try_from(value) {
        Ok(v) if (1..=max).contains(&v) => Ok(v),
        _ => Err(ConvertError::format(format!(
            "{what} {value} is outside 1..={max}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct RawLayer {
    #[serde(rename = "nInputPlane")]
    n_input_plane: usize,
    #[serde(rename = "nOutputPlane")]
    n_output_plane: usize,
    #[serde(rename = "kW")]
    kw: usize,
    #[serde(rename = "kH")]
    kh: usize,
    weight: Vec<Vec<Vec<Vec<f64>>>>,
    bias: Vec<f64>,
}

static NEXT_MODEL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a loaded model, used by backends to cache uploaded weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelId(u64);

/// Ordered, chain-consistent stack of layers. Read-only once built.
#[derive(Debug, Clone)]
pub struct Model {
    id: ModelId,
    layers: Vec<Layer>,
}

impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        self.layers == other.layers
    }
}

impl Model {
    /// Wrap layers after checking that each one feeds the next.
    pub fn from_layers(layers: Vec<Layer>) -> Result<Self> {
        validate(&layers)?;
        Ok(Self {
            id: ModelId(NEXT_MODEL_ID.fetch_add(1, Ordering::Relaxed)),
            layers,
        })
    }

    /// Load by extension: `.json` goes through the JSON reader, anything else is binary.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::load_json(path)
        } else {
            Self::load_binary(path)
        }
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let _guard = timing_guard(format!("load JSON model {}", path.display()), log::Level::Debug);
        let file = File::open(path).map_err(|e| ConvertError::io(path, e))?;
        let model = Self::from_json_reader(BufReader::new(file)).map_err(|e| e.at_path(path))?;
        info!(
            target: "w2x::core",
            "Loaded JSON model {} ({} layers, border {})",
            path.display(),
            model.len(),
            model.border()
        );
        Ok(model)
    }

    pub fn load_binary<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let _guard = timing_guard(
            format!("load binary model {}", path.display()),
            log::Level::Debug,
        );
        let file = File::open(path).map_err(|e| ConvertError::io(path, e))?;
        let model =
            Self::read_binary(&mut BufReader::new(file)).map_err(|e| e.at_path(path))?;
        info!(
            target: "w2x::core",
            "Loaded binary model {} ({} layers, border {})",
            path.display(),
            model.len(),
            model.border()
        );
        Ok(model)
    }

    pub fn from_json_reader<R: Read>(reader: R) -> Result<Self> {
        let raw: Vec<RawLayer> = serde_json::from_reader(reader)
            .map_err(|e| ConvertError::format(format!("malformed model JSON: {e}")))?;
        Self::from_raw(raw)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: Vec<RawLayer> = serde_json::from_str(json)
            .map_err(|e| ConvertError::format(format!("malformed model JSON: {e}")))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: Vec<RawLayer>) -> Result<Self> {
        let layers = raw
            .into_iter()
            .enumerate()
            .map(|(index, layer)| Layer::from_json(layer, index))
            .collect::<Result<Vec<_>>>()?;
        let model = Self::from_layers(layers)?;
        model.log_layers();
        Ok(model)
    }

    /// Read a model from its binary form.
    pub fn read_binary<R: Read>(reader: &mut R) -> Result<Self> {
        let count = read_i32(reader, "layer count")?;
        if count <= 0 {
            return Err(ConvertError::format(format!(
                "model must contain at least one layer (count is {count})"
            )));
        }
        let mut layers = Vec::new();
        for _ in 0..count {
            layers.push(Layer::read_binary(reader)?);
        }
        let model = Self::from_layers(layers)?;
        model.log_layers();
        Ok(model)
    }

    /// Write the binary form, layer count first.
    pub fn write_binary<W: Write>(&self, writer: &mut W) -> Result<()> {
        let count = i32::try_from(self.layers.len())
            .map_err(|_| ConvertError::format("too many layers for the binary format"))?;
        writer
            .write_all(&count.to_le_bytes())
            .map_err(|e| ConvertError::io(STREAM_PATH, e))?;
        for layer in &self.layers {
            layer.write_binary(writer)?;
        }
        Ok(())
    }

    pub fn save_binary<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| ConvertError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        self.write_binary(&mut writer)
            .and_then(|()| writer.flush().map_err(|e| ConvertError::io(path, e)))
            .map_err(|e| e.at_path(path))?;
        info!(
            target: "w2x::core",
            "Saved {} layers to {}",
            self.len(),
            path.display()
        );
        Ok(())
    }

    pub fn id(&self) -> ModelId {
        self.id
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Planes the first layer consumes.
    pub fn input_planes(&self) -> usize {
        self.layers.first().map_or(0, Layer::n_input_planes)
    }

    /// Planes the last layer produces.
    pub fn output_planes(&self) -> usize {
        self.layers.last().map_or(0, Layer::n_output_planes)
    }

    /// Receptive border in pixels: the sum of every layer's kernel radius.
    ///
    /// For the usual 3×3 stacks this equals the number of layers.
    pub fn border(&self) -> usize {
        self.layers.iter().map(Layer::radius).sum()
    }

    /// Widest plane stack any layer reads or writes.
    pub fn max_planes(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.n_input_planes.max(l.n_output_planes))
            .max()
            .unwrap_or(0)
    }

    fn log_layers(&self) {
        if log::log_enabled!(target: "w2x::core", log::Level::Debug) {
            for (index, layer) in self.layers.iter().enumerate() {
                debug!(target: "w2x::core", "layer {index}: {layer}");
            }
        }
    }
}

/// Check that the stack is non-empty and every layer feeds the next.
pub fn validate(layers: &[Layer]) -> Result<()> {
    if layers.is_empty() {
        return Err(ConvertError::format("model must contain at least one layer"));
    }
    for (index, pair) in layers.windows(2).enumerate() {
        let (produced, consumed) = (pair[0].n_output_planes, pair[1].n_input_planes);
        if produced != consumed {
            return Err(ConvertError::format(format!(
                "layer {index} outputs {produced} planes but layer {} expects {consumed}",
                index + 1
            )));
        }
    }
    Ok(())
}
