//! YOLOv8 detection network (backbone, neck and anchor-free head) built on
//! `candle-nn`. Parameter names follow the layout of the published
//! `yolov8{n,s,m,l,x}.safetensors` weights.

use candle_core::{DType, IndexOp, Module, Result, Tensor, D};
use candle_nn::{batch_norm, conv2d, conv2d_no_bias, Conv2d, Conv2dConfig, VarBuilder};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Multiples {
    depth: f64,
    width: f64,
    ratio: f64,
}

impl Multiples {
    pub fn for_variant(variant: &str) -> Option<Self> {
        let (depth, width, ratio) = match variant {
            "n" => (0.33, 0.25, 2.0),
            "s" => (0.33, 0.50, 2.0),
            "m" => (0.67, 0.75, 1.5),
            "l" => (1.00, 1.00, 1.0),
            "x" => (1.00, 1.25, 1.0),
            _ => return None,
        };
        Some(Self { depth, width, ratio })
    }

    /// Variant whose first convolution has `channels` output channels
    /// (`64 * width`).
    pub fn variant_for_stem_channels(channels: usize) -> Option<&'static str> {
        match channels {
            16 => Some("n"),
            32 => Some("s"),
            48 => Some("m"),
            64 => Some("l"),
            80 => Some("x"),
            _ => None,
        }
    }

    fn filters(&self) -> (usize, usize, usize) {
        let f1 = (256. * self.width) as usize;
        let f2 = (512. * self.width) as usize;
        let f3 = (512. * self.width * self.ratio) as usize;
        (f1, f2, f3)
    }
}

#[derive(Debug)]
struct Upsample {
    scale_factor: usize,
}

impl Module for Upsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_b, _c, h, w) = xs.dims4()?;
        xs.upsample_nearest2d(self.scale_factor * h, self.scale_factor * w)
    }
}

/// Convolution with folded batch-norm followed by SiLU.
#[derive(Debug)]
struct ConvBlock {
    conv: Conv2d,
}

impl ConvBlock {
    fn load(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        k: usize,
        stride: usize,
        padding: Option<usize>,
    ) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: padding.unwrap_or(k / 2),
            stride,
            ..Default::default()
        };
        let bn = batch_norm(c2, 1e-3, vb.pp("bn"))?;
        let conv = conv2d_no_bias(c1, c2, k, cfg, vb.pp("conv"))?.absorb_bn(&bn)?;
        Ok(Self { conv })
    }
}

impl Module for ConvBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv.forward(xs)?.silu()
    }
}

#[derive(Debug)]
struct Bottleneck {
    cv1: ConvBlock,
    cv2: ConvBlock,
    residual: bool,
}

impl Bottleneck {
    fn load(vb: VarBuilder, c1: usize, c2: usize, shortcut: bool) -> Result<Self> {
        let cv1 = ConvBlock::load(vb.pp("cv1"), c1, c2, 3, 1, None)?;
        let cv2 = ConvBlock::load(vb.pp("cv2"), c2, c2, 3, 1, None)?;
        Ok(Self {
            cv1,
            cv2,
            residual: c1 == c2 && shortcut,
        })
    }
}

impl Module for Bottleneck {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = self.cv2.forward(&self.cv1.forward(xs)?)?;
        if self.residual {
            xs + ys
        } else {
            Ok(ys)
        }
    }
}

#[derive(Debug)]
struct C2f {
    cv1: ConvBlock,
    cv2: ConvBlock,
    bottleneck: Vec<Bottleneck>,
}

impl C2f {
    fn load(vb: VarBuilder, c1: usize, c2: usize, n: usize, shortcut: bool) -> Result<Self> {
        let c = c2 / 2;
        let cv1 = ConvBlock::load(vb.pp("cv1"), c1, 2 * c, 1, 1, None)?;
        let cv2 = ConvBlock::load(vb.pp("cv2"), (2 + n) * c, c2, 1, 1, None)?;
        let bottleneck = (0..n)
            .map(|idx| Bottleneck::load(vb.pp(format!("bottleneck.{idx}")), c, c, shortcut))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            cv1,
            cv2,
            bottleneck,
        })
    }
}

impl Module for C2f {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut ys = self.cv1.forward(xs)?.chunk(2, 1)?;
        for m in self.bottleneck.iter() {
            let next = m.forward(&ys[ys.len() - 1])?;
            ys.push(next);
        }
        self.cv2.forward(&Tensor::cat(ys.as_slice(), 1)?)
    }
}

/// Spatial pyramid pooling (fast).
#[derive(Debug)]
struct Sppf {
    cv1: ConvBlock,
    cv2: ConvBlock,
    k: usize,
}

impl Sppf {
    fn load(vb: VarBuilder, c1: usize, c2: usize, k: usize) -> Result<Self> {
        let c = c1 / 2;
        let cv1 = ConvBlock::load(vb.pp("cv1"), c1, c, 1, 1, None)?;
        let cv2 = ConvBlock::load(vb.pp("cv2"), c * 4, c2, 1, 1, None)?;
        Ok(Self { cv1, cv2, k })
    }

    fn pool(&self, xs: &Tensor) -> Result<Tensor> {
        let pad = self.k / 2;
        xs.pad_with_zeros(2, pad, pad)?
            .pad_with_zeros(3, pad, pad)?
            .max_pool2d_with_stride(self.k, 1)
    }
}

impl Module for Sppf {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.cv1.forward(xs)?;
        let xs2 = self.pool(&xs)?;
        let xs3 = self.pool(&xs2)?;
        let xs4 = self.pool(&xs3)?;
        self.cv2.forward(&Tensor::cat(&[&xs, &xs2, &xs3, &xs4], 1)?)
    }
}

/// Distribution focal loss integral: turns the per-side bin logits into
/// expected distances.
#[derive(Debug)]
struct Dfl {
    conv: Conv2d,
    bins: usize,
}

impl Dfl {
    fn load(vb: VarBuilder, bins: usize) -> Result<Self> {
        let conv = conv2d_no_bias(bins, 1, 1, Default::default(), vb.pp("conv"))?;
        Ok(Self { conv, bins })
    }
}

impl Module for Dfl {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, _c, anchors) = xs.dims3()?;
        let xs = xs.reshape((b, 4, self.bins, anchors))?.transpose(2, 1)?;
        let xs = candle_nn::ops::softmax(&xs, 1)?;
        self.conv.forward(&xs)?.reshape((b, 4, anchors))
    }
}

#[derive(Debug)]
struct DarkNet {
    b1_0: ConvBlock,
    b1_1: ConvBlock,
    b2_0: C2f,
    b2_1: ConvBlock,
    b2_2: C2f,
    b3_0: ConvBlock,
    b3_1: C2f,
    b4_0: ConvBlock,
    b4_1: C2f,
    b5: Sppf,
}

impl DarkNet {
    fn load(vb: VarBuilder, m: Multiples) -> Result<Self> {
        let (w, r, d) = (m.width, m.ratio, m.depth);
        let c = |base: f64| (base * w) as usize;
        let n = |base: f64| (base * d).round() as usize;

        Ok(Self {
            b1_0: ConvBlock::load(vb.pp("b1.0"), 3, c(64.), 3, 2, Some(1))?,
            b1_1: ConvBlock::load(vb.pp("b1.1"), c(64.), c(128.), 3, 2, Some(1))?,
            b2_0: C2f::load(vb.pp("b2.0"), c(128.), c(128.), n(3.), true)?,
            b2_1: ConvBlock::load(vb.pp("b2.1"), c(128.), c(256.), 3, 2, Some(1))?,
            b2_2: C2f::load(vb.pp("b2.2"), c(256.), c(256.), n(6.), true)?,
            b3_0: ConvBlock::load(vb.pp("b3.0"), c(256.), c(512.), 3, 2, Some(1))?,
            b3_1: C2f::load(vb.pp("b3.1"), c(512.), c(512.), n(6.), true)?,
            b4_0: ConvBlock::load(vb.pp("b4.0"), c(512.), c(512. * r), 3, 2, Some(1))?,
            b4_1: C2f::load(vb.pp("b4.1"), c(512. * r), c(512. * r), n(3.), true)?,
            b5: Sppf::load(vb.pp("b5.0"), c(512. * r), c(512. * r), 5)?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let x1 = self.b1_1.forward(&self.b1_0.forward(xs)?)?;
        let x2 = self
            .b2_2
            .forward(&self.b2_1.forward(&self.b2_0.forward(&x1)?)?)?;
        let x3 = self.b3_1.forward(&self.b3_0.forward(&x2)?)?;
        let x4 = self.b4_1.forward(&self.b4_0.forward(&x3)?)?;
        let x5 = self.b5.forward(&x4)?;
        Ok((x2, x3, x5))
    }
}

#[derive(Debug)]
struct Neck {
    up: Upsample,
    n1: C2f,
    n2: C2f,
    n3: ConvBlock,
    n4: C2f,
    n5: ConvBlock,
    n6: C2f,
}

impl Neck {
    fn load(vb: VarBuilder, m: Multiples) -> Result<Self> {
        let (w, r, d) = (m.width, m.ratio, m.depth);
        let n = (3. * d).round() as usize;
        let c = |base: f64| (base * w) as usize;

        Ok(Self {
            up: Upsample { scale_factor: 2 },
            n1: C2f::load(vb.pp("n1"), c(512. * (1. + r)), c(512.), n, false)?,
            n2: C2f::load(vb.pp("n2"), c(768.), c(256.), n, false)?,
            n3: ConvBlock::load(vb.pp("n3"), c(256.), c(256.), 3, 2, Some(1))?,
            n4: C2f::load(vb.pp("n4"), c(768.), c(512.), n, false)?,
            n5: ConvBlock::load(vb.pp("n5"), c(512.), c(512.), 3, 2, Some(1))?,
            n6: C2f::load(vb.pp("n6"), c(512. * (1. + r)), c(512. * r), n, false)?,
        })
    }

    fn forward(&self, p3: &Tensor, p4: &Tensor, p5: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let x = self
            .n1
            .forward(&Tensor::cat(&[&self.up.forward(p5)?, p4], 1)?)?;
        let head_1 = self
            .n2
            .forward(&Tensor::cat(&[&self.up.forward(&x)?, p3], 1)?)?;
        let head_2 = self
            .n4
            .forward(&Tensor::cat(&[&self.n3.forward(&head_1)?, &x], 1)?)?;
        let head_3 = self
            .n6
            .forward(&Tensor::cat(&[&self.n5.forward(&head_2)?, p5], 1)?)?;
        Ok((head_1, head_2, head_3))
    }
}

#[derive(Debug)]
struct Branch {
    block0: ConvBlock,
    block1: ConvBlock,
    conv: Conv2d,
}

impl Branch {
    fn load(vb: VarBuilder, filter: usize, hidden: usize, out: usize) -> Result<Self> {
        Ok(Self {
            block0: ConvBlock::load(vb.pp("0"), filter, hidden, 3, 1, None)?,
            block1: ConvBlock::load(vb.pp("1"), hidden, hidden, 3, 1, None)?,
            conv: conv2d(hidden, out, 1, Default::default(), vb.pp("2"))?,
        })
    }
}

impl Module for Branch {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.block0.forward(xs)?;
        let xs = self.block1.forward(&xs)?;
        self.conv.forward(&xs)
    }
}

/// First backbone convolution; dim 0 fixes the width multiple.
pub const STEM_WEIGHT: &str = "net.b1.0.conv.weight";
/// Final class projection of the first head level; dim 0 is the class count.
pub const CLASS_WEIGHT: &str = "head.cv3.0.2.weight";

const DFL_BINS: usize = 16;
const STRIDES: [usize; 3] = [8, 16, 32];

#[derive(Debug)]
struct DetectionHead {
    dfl: Dfl,
    cv2: Vec<Branch>,
    cv3: Vec<Branch>,
    no: usize,
}

impl DetectionHead {
    fn load(vb: VarBuilder, nc: usize, filters: (usize, usize, usize)) -> Result<Self> {
        let dfl = Dfl::load(vb.pp("dfl"), DFL_BINS)?;
        let c1 = usize::max(filters.0, nc);
        let c2 = usize::max(filters.0 / 4, DFL_BINS * 4);

        let mut cv2 = Vec::with_capacity(3);
        let mut cv3 = Vec::with_capacity(3);
        for (i, filter) in [filters.0, filters.1, filters.2].into_iter().enumerate() {
            cv2.push(Branch::load(vb.pp(format!("cv2.{i}")), filter, c2, 4 * DFL_BINS)?);
            cv3.push(Branch::load(vb.pp(format!("cv3.{i}")), filter, c1, nc)?);
        }

        Ok(Self {
            dfl,
            cv2,
            cv3,
            no: nc + DFL_BINS * 4,
        })
    }

    fn forward(&self, xs: [&Tensor; 3]) -> Result<Tensor> {
        let mut levels = Vec::with_capacity(3);
        for (i, x) in xs.iter().enumerate() {
            let box_ = self.cv2[i].forward(x)?;
            let cls = self.cv3[i].forward(x)?;
            levels.push(Tensor::cat(&[&box_, &cls], 1)?);
        }

        let (anchors, strides) = make_anchors(&levels, 0.5)?;
        let anchors = anchors.transpose(0, 1)?.unsqueeze(0)?;
        let strides = strides.transpose(0, 1)?;

        let flat = levels
            .iter()
            .map(|l| {
                let b = l.dim(0)?;
                l.reshape((b, self.no, l.elem_count() / (b * self.no)))
            })
            .collect::<Result<Vec<_>>>()?;
        let x_cat = Tensor::cat(flat.as_slice(), 2)?;

        let box_ = x_cat.i((.., ..DFL_BINS * 4))?;
        let cls = x_cat.i((.., DFL_BINS * 4..))?;

        let dbox = dist2bbox(&self.dfl.forward(&box_)?, &anchors)?;
        let dbox = dbox.broadcast_mul(&strides)?;
        Tensor::cat(&[dbox, candle_nn::ops::sigmoid(&cls)?], 1)
    }
}

fn make_anchors(levels: &[Tensor], offset: f64) -> Result<(Tensor, Tensor)> {
    let mut anchor_points = Vec::with_capacity(levels.len());
    let mut stride_tensor = Vec::with_capacity(levels.len());

    for (xs, stride) in levels.iter().zip(STRIDES) {
        let dev = xs.device();
        let (_, _, h, w) = xs.dims4()?;
        let sx = (Tensor::arange(0u32, w as u32, dev)?.to_dtype(DType::F32)? + offset)?;
        let sy = (Tensor::arange(0u32, h as u32, dev)?.to_dtype(DType::F32)? + offset)?;
        let sx = sx.reshape((1, w))?.repeat((h, 1))?.flatten_all()?;
        let sy = sy.reshape((h, 1))?.repeat((1, w))?.flatten_all()?;
        anchor_points.push(Tensor::stack(&[&sx, &sy], D::Minus1)?);
        stride_tensor.push((Tensor::ones(h * w, DType::F32, dev)? * stride as f64)?);
    }

    let anchor_points = Tensor::cat(anchor_points.as_slice(), 0)?;
    let stride_tensor = Tensor::cat(stride_tensor.as_slice(), 0)?.unsqueeze(1)?;
    Ok((anchor_points, stride_tensor))
}

fn dist2bbox(distance: &Tensor, anchor_points: &Tensor) -> Result<Tensor> {
    let chunks = distance.chunk(2, 1)?;
    let x1y1 = anchor_points.broadcast_sub(&chunks[0])?;
    let x2y2 = anchor_points.broadcast_add(&chunks[1])?;
    let c_xy = ((&x1y1 + &x2y2)? * 0.5)?;
    let wh = (&x2y2 - &x1y1)?;
    Tensor::cat(&[c_xy, wh], 1)
}

/// Full network. `forward` maps a `(batch, 3, h, w)` image tensor scaled to
/// `[0, 1]` to `(batch, 4 + classes, anchors)` where the first four rows are
/// centre-x, centre-y, width, height in input pixels and the rest are
/// per-class scores.
#[derive(Debug)]
pub struct YoloV8 {
    net: DarkNet,
    fpn: Neck,
    head: DetectionHead,
}

impl YoloV8 {
    pub fn load(vb: VarBuilder, m: Multiples, num_classes: usize) -> Result<Self> {
        let net = DarkNet::load(vb.pp("net"), m)?;
        let fpn = Neck::load(vb.pp("fpn"), m)?;
        let head = DetectionHead::load(vb.pp("head"), num_classes, m.filters())?;
        Ok(Self { net, fpn, head })
    }
}

impl Module for YoloV8 {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (p3, p4, p5) = self.net.forward(xs)?;
        let (h1, h2, h3) = self.fpn.forward(&p3, &p4, &p5)?;
        self.head.forward([&h1, &h2, &h3])
    }
}
