// Granite decoder with LoRA injection
//
// Llama-family architecture plus Granite's scalar multipliers:
//   embeddings * embedding_multiplier
//   each residual branch * residual_multiplier
//   attention scores * attention_multiplier (default 1/sqrt(head_dim))
//   logits / logits_scaling
// A plain Llama config.json parses too; the multipliers then default to the
// Llama behaviour.
//
// Every op here is differentiable so the same forward serves generation (with
// KV cache) and training (without cache, gradients reaching the adapters).

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{Embedding, Init, Linear, VarBuilder};
use serde::Deserialize;
use std::fmt;

use super::lora::{LoraConfig, LoraLinear};

fn default_one() -> f64 {
    1.0
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_eps() -> f64 {
    1e-6
}

fn default_max_positions() -> usize {
    4096
}

/// `config.json` of a Granite or Llama checkpoint
#[derive(Debug, Clone, Deserialize)]
pub struct GraniteConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default = "default_rms_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_max_positions")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub attention_bias: bool,
    #[serde(default)]
    pub mlp_bias: bool,
    #[serde(default = "default_one")]
    pub embedding_multiplier: f64,
    #[serde(default = "default_one")]
    pub residual_multiplier: f64,
    #[serde(default)]
    pub attention_multiplier: Option<f64>,
    #[serde(default = "default_one")]
    pub logits_scaling: f64,
    #[serde(default)]
    pub eos_token_id: Option<EosTokenId>,
}

/// `eos_token_id` is a single id in Granite configs and a list in some Llama ones
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum EosTokenId {
    Single(u32),
    Multiple(Vec<u32>),
}

impl EosTokenId {
    pub fn ids(&self) -> Vec<u32> {
        match self {
            EosTokenId::Single(id) => vec![*id],
            EosTokenId::Multiple(ids) => ids.clone(),
        }
    }
}

impl GraniteConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn attention_scale(&self) -> f64 {
        self.attention_multiplier
            .unwrap_or_else(|| 1.0 / (self.head_dim() as f64).sqrt())
    }

    /// Parameter count of the frozen base model
    pub fn base_parameters(&self) -> usize {
        let h = self.hidden_size;
        let kv = self.head_dim() * self.kv_heads();
        let attention = 2 * h * h + 2 * h * kv;
        let mlp = 3 * h * self.intermediate_size;
        let norms = 2 * h;
        let per_layer = attention + mlp + norms;
        let embeddings = self.vocab_size * h;
        let head = if self.tie_word_embeddings { 0 } else { self.vocab_size * h };
        embeddings + self.num_hidden_layers * per_layer + h + head
    }
}

/// Trainable vs total parameters, printed before training starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterSummary {
    pub trainable: usize,
    pub total: usize,
}

impl ParameterSummary {
    pub fn trainable_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.trainable as f64 / self.total as f64 * 100.0
        }
    }
}

impl fmt::Display for ParameterSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            self.trainable,
            self.total,
            self.trainable_percent()
        )
    }
}

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> Result<Tensor> {
    let on_true = Tensor::new(on_true, on_false.device())?.broadcast_as(mask.shape().dims())?;
    mask.where_cond(&on_true, on_false)
}

/// `mask[i][j] = 1` where query `i` (at absolute position `i + offset`) may
/// not see key `j`
fn causal_mask(seq_len: usize, offset: usize, device: &Device) -> Result<Tensor> {
    let total = seq_len + offset;
    let mask: Vec<u8> = (0..seq_len)
        .flat_map(|i| (0..total).map(move |j| u8::from(j > i + offset)))
        .collect();
    Tensor::from_slice(&mask, (seq_len, total), device)
}

fn rotate_half(xs: &Tensor) -> Result<Tensor> {
    let last = xs.dim(D::Minus1)?;
    let x1 = xs.narrow(D::Minus1, 0, last / 2)?;
    let x2 = xs.narrow(D::Minus1, last / 2, last - last / 2)?;
    Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)
}

#[derive(Debug, Clone)]
struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn load(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let norm = (xs.sqr()?.mean_keepdim(D::Minus1)? + self.eps)?.sqrt()?;
        xs.broadcast_div(&norm)?
            .to_dtype(dtype)?
            .broadcast_mul(&self.weight)
    }
}

/// Rotary tables, full head width (`cos(θ)` repeated for both halves)
#[derive(Debug, Clone)]
struct Rotary {
    cos: Tensor,
    sin: Tensor,
}

impl Rotary {
    fn new(cfg: &GraniteConfig, dtype: DType, device: &Device) -> Result<Self> {
        let head_dim = cfg.head_dim();
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1f32 / (cfg.rope_theta as f32).powf(i as f32 / head_dim as f32))
            .collect();
        let inv_freq = Tensor::new(inv_freq.as_slice(), device)?;
        let positions = cfg.max_position_embeddings;
        let freqs = Tensor::arange(0, positions as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((positions, 1))?
            .matmul(&inv_freq.reshape((1, inv_freq.elem_count()))?)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;

        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    /// `xs`: (batch, heads, seq, head_dim)
    fn apply(&self, xs: &Tensor, offset: usize) -> Result<Tensor> {
        let seq_len = xs.dim(2)?;
        let cos = self.cos.narrow(0, offset, seq_len)?;
        let sin = self.sin.narrow(0, offset, seq_len)?;
        xs.broadcast_mul(&cos)? + rotate_half(xs)?.broadcast_mul(&sin)?
    }
}

fn projection(
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    name: &str,
    vb: &VarBuilder,
    lora: Option<(&LoraConfig, &VarBuilder)>,
) -> Result<LoraLinear> {
    let base: Linear = candle_nn::linear_b(in_dim, out_dim, bias, vb.pp(name))?;
    match lora {
        Some((config, lora_vb)) if config.targets(name) => {
            LoraLinear::with_adapter(base, config, lora_vb.pp(name))
        }
        _ => Ok(LoraLinear::frozen(base)),
    }
}

#[derive(Debug, Clone)]
struct Attention {
    q_proj: LoraLinear,
    k_proj: LoraLinear,
    v_proj: LoraLinear,
    o_proj: LoraLinear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    fn load(cfg: &GraniteConfig, vb: VarBuilder, lora: Option<(&LoraConfig, &VarBuilder)>) -> Result<Self> {
        let h = cfg.hidden_size;
        let q_dim = cfg.head_dim() * cfg.num_attention_heads;
        let kv_dim = cfg.head_dim() * cfg.kv_heads();
        let bias = cfg.attention_bias;

        Ok(Self {
            q_proj: projection(h, q_dim, bias, "q_proj", &vb, lora)?,
            k_proj: projection(h, kv_dim, bias, "k_proj", &vb, lora)?,
            v_proj: projection(h, kv_dim, bias, "v_proj", &vb, lora)?,
            o_proj: projection(q_dim, h, bias, "o_proj", &vb, lora)?,
            num_heads: cfg.num_attention_heads,
            num_kv_heads: cfg.kv_heads(),
            head_dim: cfg.head_dim(),
            scale: cfg.attention_scale(),
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        offset: usize,
        rotary: &Rotary,
        cache: Option<&mut Option<(Tensor, Tensor)>>,
        train: bool,
    ) -> Result<Tensor> {
        let (b_sz, seq_len, _) = xs.dims3()?;

        let q = self
            .q_proj
            .forward_t(xs, train)?
            .reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward_t(xs, train)?
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward_t(xs, train)?
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = rotary.apply(&q, offset)?;
        let mut k = rotary.apply(&k, offset)?;
        let mut v = v;

        if let Some(cache) = cache {
            if let Some((cache_k, cache_v)) = cache.as_ref() {
                k = Tensor::cat(&[cache_k, &k], 2)?.contiguous()?;
                v = Tensor::cat(&[cache_v, &v], 2)?.contiguous()?;
            }
            *cache = Some((k.clone(), v.clone()));
        }

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = candle_transformers::utils::repeat_kv(k, n_rep)?;
        let v = candle_transformers::utils::repeat_kv(v, n_rep)?;

        let in_dtype = q.dtype();
        let q = q.to_dtype(DType::F32)?;
        let k = k.to_dtype(DType::F32)?;
        let v = v.to_dtype(DType::F32)?;

        let att = (q.matmul(&k.t()?)? * self.scale)?;
        let att = if seq_len == 1 {
            att
        } else {
            let mask = causal_mask(seq_len, offset, xs.device())?.broadcast_as(att.shape())?;
            masked_fill(&att, &mask, f32::NEG_INFINITY)?
        };
        let att = candle_nn::ops::softmax(&att, D::Minus1)?;

        let ys = att
            .matmul(&v.contiguous()?)?
            .to_dtype(in_dtype)?
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward_t(&ys, train)
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    gate_proj: LoraLinear,
    up_proj: LoraLinear,
    down_proj: LoraLinear,
}

impl Mlp {
    fn load(cfg: &GraniteConfig, vb: VarBuilder, lora: Option<(&LoraConfig, &VarBuilder)>) -> Result<Self> {
        let h = cfg.hidden_size;
        let i = cfg.intermediate_size;
        let bias = cfg.mlp_bias;
        Ok(Self {
            gate_proj: projection(h, i, bias, "gate_proj", &vb, lora)?,
            up_proj: projection(h, i, bias, "up_proj", &vb, lora)?,
            down_proj: projection(i, h, bias, "down_proj", &vb, lora)?,
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward_t(xs, train)?)?;
        let ys = (gate * self.up_proj.forward_t(xs, train)?)?;
        self.down_proj.forward_t(&ys, train)
    }
}

#[derive(Debug, Clone)]
struct Block {
    input_layernorm: RmsNorm,
    attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
    residual_multiplier: f64,
}

impl Block {
    fn load(cfg: &GraniteConfig, vb: VarBuilder, lora: Option<(&LoraConfig, &VarBuilder)>) -> Result<Self> {
        let attn_lora = lora.map(|(c, v)| (c, v.pp("self_attn")));
        let mlp_lora = lora.map(|(c, v)| (c, v.pp("mlp")));
        Ok(Self {
            input_layernorm: RmsNorm::load(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?,
            attn: Attention::load(cfg, vb.pp("self_attn"), attn_lora.as_ref().map(|(c, v)| (*c, v)))?,
            post_attention_layernorm: RmsNorm::load(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
            mlp: Mlp::load(cfg, vb.pp("mlp"), mlp_lora.as_ref().map(|(c, v)| (*c, v)))?,
            residual_multiplier: cfg.residual_multiplier,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        offset: usize,
        rotary: &Rotary,
        cache: Option<&mut Option<(Tensor, Tensor)>>,
        train: bool,
    ) -> Result<Tensor> {
        let residual = xs;
        let ys = self
            .attn
            .forward(&self.input_layernorm.forward(xs)?, offset, rotary, cache, train)?;
        let xs = (residual + (ys * self.residual_multiplier)?)?;

        let residual = &xs;
        let ys = self
            .mlp
            .forward(&self.post_attention_layernorm.forward(&xs)?, train)?;
        residual + (ys * self.residual_multiplier)?
    }
}

/// Granite causal LM
pub struct GraniteModel {
    embed_tokens: Embedding,
    layers: Vec<Block>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary: Rotary,
    kv_cache: Vec<Option<(Tensor, Tensor)>>,
    config: GraniteConfig,
    device: Device,
}

impl GraniteModel {
    /// Build from base weights under `vb` (HF layout: `model.*`, `lm_head`).
    ///
    /// When `lora` is given, A/B matrices for the targeted projections are
    /// created under its builder as `model.layers.{i}.self_attn.q_proj.lora_A.weight`.
    pub fn load(cfg: &GraniteConfig, vb: VarBuilder, lora: Option<(&LoraConfig, VarBuilder)>) -> Result<Self> {
        let device = vb.device().clone();
        let embed_tokens = candle_nn::embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("model.embed_tokens"))?;
        let rotary = Rotary::new(cfg, vb.dtype(), &device)?;

        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for idx in 0..cfg.num_hidden_layers {
            let name = format!("model.layers.{}", idx);
            let layer_lora = lora.as_ref().map(|(c, v)| (*c, v.pp(&name)));
            layers.push(Block::load(
                cfg,
                vb.pp(&name),
                layer_lora.as_ref().map(|(c, v)| (*c, v)),
            )?);
        }

        let norm = RmsNorm::load(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("model.norm"))?;
        let lm_head = if cfg.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            candle_nn::linear_no_bias(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?
        };

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            kv_cache: vec![None; cfg.num_hidden_layers],
            config: cfg.clone(),
            device,
        })
    }

    pub fn config(&self) -> &GraniteConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn clear_kv_cache(&mut self) {
        self.kv_cache.iter_mut().for_each(|c| *c = None);
    }

    /// Trainable (adapter) vs total parameters
    pub fn parameter_summary(&self, trainable: usize) -> ParameterSummary {
        ParameterSummary {
            trainable,
            total: self.config.base_parameters() + trainable,
        }
    }

    fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.embed_tokens.forward(input_ids)? * self.config.embedding_multiplier
    }

    fn head(&self, xs: &Tensor) -> Result<Tensor> {
        let logits = self.lm_head.forward(&self.norm.forward(xs)?)?;
        (logits / self.config.logits_scaling)?.to_dtype(DType::F32)
    }

    /// Incremental forward with KV cache; returns F32 logits of the last
    /// position, shape (batch, vocab)
    pub fn forward(&mut self, input_ids: &Tensor, offset: usize) -> Result<Tensor> {
        let (_b_sz, seq_len) = input_ids.dims2()?;
        let mut xs = self.embed(input_ids)?;
        for (layer, cache) in self.layers.iter().zip(self.kv_cache.iter_mut()) {
            xs = layer.forward(&xs, offset, &self.rotary, Some(cache), false)?;
        }
        let last = xs.narrow(1, seq_len - 1, 1)?;
        self.head(&last)?.squeeze(1)
    }

    /// Full-sequence forward without cache; returns F32 logits of every
    /// position, shape (batch, seq, vocab). `train` enables adapter dropout.
    pub fn forward_all(&self, input_ids: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = self.embed(input_ids)?;
        for layer in &self.layers {
            xs = layer.forward(&xs, 0, &self.rotary, None, train)?;
        }
        self.head(&xs)
    }
}
