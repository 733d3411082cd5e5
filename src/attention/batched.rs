//! Batched paged-attention path.
//!
//! Builds flashinfer-style index arrays over the paged cache and runs
//! grouped scaled dot-product attention per request with candle ops. For
//! non-prompt batches the dense custom mask from the mask update replaces
//! plain causal masking, because a speculative tree is not linearly causal.
//!
//! ## Paged Index
//!
//! ```text
//! qo_indptr:        [0, 3, 4]             query rows of request r: qo[r]..qo[r+1]
//! kv_indptr:        [0, 1, 3]             pages of request r:      kv[r]..kv[r+1]
//! kv_indices:       [0, 4, 5]             physical page ids
//! kv_last_page_len: [3, 2]                valid slots in each request's last page
//! mask_indptr:      [0, 9, 27]            offsets into the packed custom mask
//! ```
//!
//! Kernels are instantiated per (head dim, group size, page size); the
//! dispatch functions map runtime values onto that closed set and reject
//! anything else.

use candle_core::{Device, Tensor, D};

use crate::attention::mask::{AttentionMask, RequestPositions, MASK_VALUE};
use crate::attention::KernelParams;
use crate::core::batch_config::BatchConfig;
use crate::core::kv_cache::{CacheElement, KvCache};
use crate::core::layout::KvLayout;
use crate::error::{Error, Result};

/// Per-request index pointers into the paged cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedIndex {
    pub slots: Vec<usize>,
    pub qo_indptr: Vec<usize>,
    pub kv_indptr: Vec<usize>,
    pub kv_indices: Vec<usize>,
    pub kv_last_page_len: Vec<usize>,
    pub mask_indptr: Vec<usize>,
}

impl PagedIndex {
    /// Build the index arrays for every active request of `bc`.
    pub fn build(bc: &BatchConfig, layout: &KvLayout) -> Result<Self> {
        if layout.page_size().is_none() {
            return Err(Error::Config(
                "batched paged attention needs a paged cache layout".into(),
            ));
        }
        let mut index = Self {
            slots: Vec::with_capacity(bc.num_active_requests()),
            qo_indptr: vec![0],
            kv_indptr: vec![0],
            kv_indices: Vec::new(),
            kv_last_page_len: Vec::new(),
            mask_indptr: vec![0],
        };
        for slot in bc.active_slots() {
            let Some(info) = bc.request(slot) else {
                continue;
            };
            let q_len = info.num_tokens_in_batch;
            let k_len = info.total_length();
            layout.check(slot, k_len.saturating_sub(1))?;

            index.slots.push(slot);
            index.qo_indptr.push(index.qo_indptr[index.qo_indptr.len() - 1] + q_len);
            index.kv_indices.extend(layout.page_table(slot, k_len));
            index.kv_indptr.push(index.kv_indices.len());
            index.kv_last_page_len.push(layout.last_page_len(k_len));
            index
                .mask_indptr
                .push(index.mask_indptr[index.mask_indptr.len() - 1] + q_len * k_len);
        }
        Ok(index)
    }

    pub fn num_requests(&self) -> usize {
        self.slots.len()
    }

    /// Number of valid key positions of request `r`.
    pub fn kv_len(&self, r: usize, page_size: usize) -> usize {
        let pages = self.kv_indptr[r + 1] - self.kv_indptr[r];
        match pages {
            0 => 0,
            n => (n - 1) * page_size + self.kv_last_page_len[r],
        }
    }
}

/// Batched paged attention for one (head dim, group size, page size)
/// instantiation.
///
/// # Arguments
///
/// * `queries` - `num_active_tokens * q_hidden` packed query elements
/// * `bc` - Current batch
/// * `cache` - Paged KV cache with `PAGE` tokens per page
/// * `params` - Head counts and softmax scale
/// * `mask` - Custom mask from the mask update, or `None` for causal masking
/// * `device` - Device to run the tensor ops on
pub fn batched_paged_attention<
    E: CacheElement,
    const HEAD_DIM: usize,
    const GROUP: usize,
    const PAGE: usize,
>(
    queries: &[E],
    bc: &BatchConfig,
    cache: &KvCache<E>,
    params: &KernelParams,
    mask: Option<&AttentionMask>,
    device: &Device,
) -> Result<Vec<E>> {
    params.check(HEAD_DIM, queries.len(), bc.num_active_tokens(), cache)?;
    if params.group_size() != GROUP || cache.layout().page_size() != Some(PAGE) {
        return Err(Error::Config(format!(
            "kernel instantiated for group {GROUP} page {PAGE}, got group {} page {:?}",
            params.group_size(),
            cache.layout().page_size()
        )));
    }

    let index = PagedIndex::build(bc, cache.layout())?;
    if let Some(mask) = mask {
        if mask.indptr() != index.mask_indptr.as_slice() {
            return Err(Error::Shape(
                "custom mask was built for a different batch".into(),
            ));
        }
    }

    let q_hidden = params.q_hidden();
    let kv_hidden = params.kv_hidden();
    let num_heads = params.num_q_heads;
    let mut output = vec![E::zero(); queries.len()];

    for r in 0..index.num_requests() {
        let slot = index.slots[r];
        let first_depth = bc
            .request(slot)
            .map(|info| info.first_token_depth_in_request)
            .unwrap_or(0);
        let q_start = index.qo_indptr[r];
        let q_len = index.qo_indptr[r + 1] - q_start;
        let k_len = index.kv_len(r, PAGE);

        let (keys, values) = gather_pages::<E, PAGE>(cache, &index, r, k_len);

        // [q_len, heads, D] -> [heads, q_len, D]
        let q: Vec<f32> = queries[q_start * q_hidden..(q_start + q_len) * q_hidden]
            .iter()
            .map(|x| x.to_f32())
            .collect();
        let q = Tensor::from_vec(q, (q_len, num_heads, HEAD_DIM), device)?
            .transpose(0, 1)?
            .contiguous()?;

        // [k_len, kv_heads, D] -> [heads, k_len, D]
        let k = repeat_kv::<GROUP>(
            &Tensor::from_vec(keys, (k_len, params.num_kv_heads, HEAD_DIM), device)?,
        )?
        .transpose(0, 1)?
        .contiguous()?;
        let v = repeat_kv::<GROUP>(
            &Tensor::from_vec(values, (k_len, params.num_kv_heads, HEAD_DIM), device)?,
        )?
        .transpose(0, 1)?
        .contiguous()?;

        // [heads, q_len, k_len]
        let attn_weights = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?)? * params.scale as f64)?;
        let bias = match mask {
            Some(mask) => mask.to_tensor(r, device)?,
            None => causal_mask(first_depth, q_len, k_len, device)?,
        };
        let mut attn_weights = attn_weights.broadcast_add(&bias.unsqueeze(0)?)?;
        if let Some(alibi) = position_bias(params, bc, slot, q_len, k_len, device)? {
            attn_weights = (attn_weights + alibi)?;
        }
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;

        // [heads, q_len, D] -> [q_len, heads * D]
        let out = attn_weights
            .matmul(&v)?
            .transpose(0, 1)?
            .contiguous()?
            .reshape((q_len, q_hidden))?
            .flatten_all()?
            .to_vec1::<f32>()?;
        for (dst, src) in output[q_start * q_hidden..(q_start + q_len) * q_hidden]
            .iter_mut()
            .zip(out)
        {
            *dst = E::from_f32(src);
        }
    }

    tracing::debug!(
        num_requests = index.num_requests(),
        num_pages = index.kv_indices.len(),
        custom_mask = mask.is_some(),
        kv_hidden,
        "batched paged attention finished"
    );
    Ok(output)
}

/// Gather request `r`'s keys and values through its page table, as `f32`.
fn gather_pages<E: CacheElement, const PAGE: usize>(
    cache: &KvCache<E>,
    index: &PagedIndex,
    r: usize,
    k_len: usize,
) -> (Vec<f32>, Vec<f32>) {
    let kv_hidden = cache.layout().kv_hidden();
    let data = cache.as_slice();
    let page_stride = 2 * PAGE * kv_hidden;
    let mut keys = Vec::with_capacity(k_len * kv_hidden);
    let mut values = Vec::with_capacity(k_len * kv_hidden);

    let pages = &index.kv_indices[index.kv_indptr[r]..index.kv_indptr[r + 1]];
    for (logical, &page) in pages.iter().enumerate() {
        let valid = if logical + 1 == pages.len() {
            index.kv_last_page_len[r]
        } else {
            PAGE
        };
        let k_base = page * page_stride;
        let v_base = k_base + PAGE * kv_hidden;
        keys.extend(data[k_base..k_base + valid * kv_hidden].iter().map(|x| x.to_f32()));
        values.extend(data[v_base..v_base + valid * kv_hidden].iter().map(|x| x.to_f32()));
    }
    (keys, values)
}

/// [seq, kv_heads, D] -> [seq, kv_heads * GROUP, D]
fn repeat_kv<const GROUP: usize>(x: &Tensor) -> Result<Tensor> {
    if GROUP == 1 {
        return Ok(x.clone());
    }
    let (seq_len, num_kv_heads, head_dim) = x.dims3()?;
    Ok(x.unsqueeze(2)?
        .expand((seq_len, num_kv_heads, GROUP, head_dim))?
        .reshape((seq_len, num_kv_heads * GROUP, head_dim))?)
}

/// `[q_len, k_len]` mask letting query `q` see keys up to `first_depth + q`.
/// `[heads, q_len, k_len]` ALiBi bias of `slot`, or `None` when disabled.
fn position_bias(
    params: &KernelParams,
    bc: &BatchConfig,
    slot: usize,
    q_len: usize,
    k_len: usize,
    device: &Device,
) -> Result<Option<Tensor>> {
    if !params.position_bias {
        return Ok(None);
    }
    let Some(positions) = RequestPositions::build(params.mask_source, bc, slot) else {
        return Ok(None);
    };
    let mut bias = Vec::with_capacity(params.num_q_heads * q_len * k_len);
    for head in 0..params.num_q_heads {
        let slope = params.alibi_slope(head).unwrap_or(0.0);
        for q in 0..q_len {
            bias.extend((0..k_len).map(|k| positions.bias(slope, q, k)));
        }
    }
    Ok(Some(Tensor::from_vec(
        bias,
        (params.num_q_heads, q_len, k_len),
        device,
    )?))
}

fn causal_mask(first_depth: usize, q_len: usize, k_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..q_len)
        .flat_map(|q| {
            (0..k_len).map(move |k| if k <= first_depth + q { 0.0 } else { MASK_VALUE })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (q_len, k_len), device)?)
}

/// Select the batched instantiation for the layer's head dim, group size
/// and page size.
pub fn dispatch_batched<E: CacheElement>(
    queries: &[E],
    bc: &BatchConfig,
    cache: &KvCache<E>,
    params: &KernelParams,
    mask: Option<&AttentionMask>,
    device: &Device,
) -> Result<Vec<E>> {
    match params.head_dim {
        64 => dispatch_group::<E, 64>(queries, bc, cache, params, mask, device),
        128 => dispatch_group::<E, 128>(queries, bc, cache, params, mask, device),
        other => Err(Error::Config(format!(
            "no batched attention kernel for head dimension {other}"
        ))),
    }
}

fn dispatch_group<E: CacheElement, const HEAD_DIM: usize>(
    queries: &[E],
    bc: &BatchConfig,
    cache: &KvCache<E>,
    params: &KernelParams,
    mask: Option<&AttentionMask>,
    device: &Device,
) -> Result<Vec<E>> {
    match params.group_size() {
        1 => dispatch_page::<E, HEAD_DIM, 1>(queries, bc, cache, params, mask, device),
        2 => dispatch_page::<E, HEAD_DIM, 2>(queries, bc, cache, params, mask, device),
        4 => dispatch_page::<E, HEAD_DIM, 4>(queries, bc, cache, params, mask, device),
        8 => dispatch_page::<E, HEAD_DIM, 8>(queries, bc, cache, params, mask, device),
        other => Err(Error::Config(format!(
            "no batched attention kernel for group size {other}"
        ))),
    }
}

fn dispatch_page<E: CacheElement, const HEAD_DIM: usize, const GROUP: usize>(
    queries: &[E],
    bc: &BatchConfig,
    cache: &KvCache<E>,
    params: &KernelParams,
    mask: Option<&AttentionMask>,
    device: &Device,
) -> Result<Vec<E>> {
    match cache.layout().page_size() {
        Some(16) => batched_paged_attention::<E, HEAD_DIM, GROUP, 16>(
            queries, bc, cache, params, mask, device,
        ),
        Some(32) => batched_paged_attention::<E, HEAD_DIM, GROUP, 32>(
            queries, bc, cache, params, mask, device,
        ),
        other => Err(Error::Config(format!(
            "no batched attention kernel for page size {other:?}"
        ))),
    }
}
