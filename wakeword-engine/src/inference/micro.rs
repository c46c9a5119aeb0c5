//! Arena-planned interpreter for the streaming op set
//!
//! Every non-constant tensor gets a fixed, 16-byte aligned slot in the
//! caller's arena, followed by a small region for resource variables that
//! carry streaming state between invocations.

use super::kernels::{self, Activation, KernelError, Padding, PoolKind, WindowParams};
use super::model::{Model, OpDef, TensorDef};
use super::{
    DType, InferenceError, Interpreter, InterpreterFactory, OpCode, OpResolver, OutputTensor,
    OutputValue,
};
use crate::arena::Arena;
use byteorder::{ByteOrder, LittleEndian};
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// Bytes reserved after the tensors for resource variables
pub const VARIABLE_ARENA_SIZE: usize = 1024;

const TENSOR_ALIGNMENT: usize = 16;

/// Creates [`MicroInterpreter`]s from serialized models
#[derive(Debug, Clone, Copy, Default)]
pub struct MicroInterpreterFactory;

impl InterpreterFactory for MicroInterpreterFactory {
    fn create(
        &self,
        model_data: &[u8],
        resolver: &OpResolver,
    ) -> Result<Box<dyn Interpreter>, InferenceError> {
        let model = Model::from_bytes(model_data)?;
        Ok(Box::new(MicroInterpreter::new(model, resolver)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OpOptions {
    None,
    Fused(Activation),
    Conv(WindowParams),
    DepthwiseConv {
        window: WindowParams,
        depth_multiplier: usize,
    },
    Pool {
        window: WindowParams,
        filter_h: usize,
        filter_w: usize,
    },
    Concatenation {
        axis: i32,
        activation: Activation,
    },
    Pack {
        axis: i32,
    },
    Mean {
        keep_dims: bool,
    },
    StridedSlice {
        begin_mask: i32,
        end_mask: i32,
    },
    VarHandle {
        resource_id: i32,
    },
    CallOnce {
        subgraph: usize,
    },
}

#[derive(Debug, Clone)]
struct PreparedOp {
    opcode: OpCode,
    inputs: Vec<Option<usize>>,
    outputs: Vec<usize>,
    options: OpOptions,
}

impl PreparedOp {
    fn input(&self, position: usize) -> Result<usize, InferenceError> {
        self.optional_input(position)
            .ok_or_else(|| kernel_error(self.opcode, format!("missing input {position}")))
    }

    fn optional_input(&self, position: usize) -> Option<usize> {
        self.inputs.get(position).copied().flatten()
    }

    fn output(&self, position: usize) -> Result<usize, InferenceError> {
        self.outputs
            .get(position)
            .copied()
            .ok_or_else(|| kernel_error(self.opcode, format!("missing output {position}")))
    }
}

fn kernel_error(op: OpCode, reason: impl Into<String>) -> InferenceError {
    InferenceError::Kernel {
        op,
        reason: reason.into(),
    }
}

fn align_up(value: usize, alignment: usize) -> Option<usize> {
    value.div_ceil(alignment).checked_mul(alignment)
}

/// Byte size of a tensor; shapes were checked when the model was validated
fn tensor_size(tensor: &TensorDef) -> Result<usize, InferenceError> {
    tensor.byte_len().ok_or_else(|| {
        InferenceError::Malformed(format!("tensor shape {:?} is too large", tensor.shape))
    })
}

/// Decode the flat parameter list of an operator
fn parse_options(op: &OpDef, subgraph_count: usize) -> Result<OpOptions, InferenceError> {
    let invalid = |reason: String| InferenceError::InvalidOptions {
        op: op.opcode,
        reason,
    };
    let param = |index: usize, default: i32| op.params.get(index).copied().unwrap_or(default);
    let activation = |index: usize| {
        let code = param(index, 0);
        Activation::from_code(code).ok_or_else(|| invalid(format!("unknown activation {code}")))
    };
    let padding = |index: usize| {
        let code = param(index, 0);
        Padding::from_code(code).ok_or_else(|| invalid(format!("unknown padding {code}")))
    };
    let positive = |index: usize, name: &str| {
        let value = param(index, 1);
        if value < 1 {
            Err(invalid(format!("{name} must be positive, got {value}")))
        } else {
            Ok(value as usize)
        }
    };

    let options = match op.opcode {
        OpCode::Add | OpCode::Mul | OpCode::FullyConnected => OpOptions::Fused(activation(0)?),
        OpCode::Conv2D => OpOptions::Conv(WindowParams {
            padding: padding(0)?,
            stride_w: positive(1, "stride_w")?,
            stride_h: positive(2, "stride_h")?,
            activation: activation(3)?,
            dilation_w: positive(4, "dilation_w")?,
            dilation_h: positive(5, "dilation_h")?,
        }),
        OpCode::DepthwiseConv2D => OpOptions::DepthwiseConv {
            window: WindowParams {
                padding: padding(0)?,
                stride_w: positive(1, "stride_w")?,
                stride_h: positive(2, "stride_h")?,
                activation: activation(4)?,
                dilation_w: positive(5, "dilation_w")?,
                dilation_h: positive(6, "dilation_h")?,
            },
            depth_multiplier: positive(3, "depth_multiplier")?,
        },
        OpCode::AveragePool2D | OpCode::MaxPool2D => OpOptions::Pool {
            window: WindowParams {
                padding: padding(0)?,
                stride_w: positive(1, "stride_w")?,
                stride_h: positive(2, "stride_h")?,
                activation: activation(5)?,
                dilation_w: 1,
                dilation_h: 1,
            },
            filter_w: positive(3, "filter_w")?,
            filter_h: positive(4, "filter_h")?,
        },
        OpCode::Concatenation => OpOptions::Concatenation {
            axis: param(0, 0),
            activation: activation(1)?,
        },
        OpCode::Pack => OpOptions::Pack { axis: param(0, 0) },
        OpCode::Mean => OpOptions::Mean {
            keep_dims: param(0, 0) != 0,
        },
        OpCode::StridedSlice => OpOptions::StridedSlice {
            begin_mask: param(0, 0),
            end_mask: param(1, 0),
        },
        OpCode::VarHandle => OpOptions::VarHandle {
            resource_id: param(0, 0),
        },
        OpCode::CallOnce => {
            let target = param(0, -1);
            match usize::try_from(target) {
                Ok(subgraph) if subgraph > 0 && subgraph < subgraph_count => {
                    OpOptions::CallOnce { subgraph }
                }
                _ => return Err(invalid(format!("init subgraph {target} does not exist"))),
            }
        }
        OpCode::Reshape
        | OpCode::ReadVariable
        | OpCode::AssignVariable
        | OpCode::Logistic
        | OpCode::Quantize
        | OpCode::Pad
        | OpCode::SplitV => OpOptions::None,
    };

    Ok(options)
}

struct MemoryPlan {
    offsets: Vec<Vec<Option<usize>>>,
    variable_base: usize,
    used_bytes: usize,
}

#[derive(Debug, Clone, Copy)]
struct Variable {
    offset: usize,
    len: usize,
}

/// Interpreter over a parsed [`Model`]
pub struct MicroInterpreter {
    model: Model,
    ops: Vec<Vec<PreparedOp>>,
    plan: Option<MemoryPlan>,
    variables: HashMap<i32, Variable>,
    variable_cursor: usize,
    initialized: HashSet<usize>,
}

impl MicroInterpreter {
    /// Bind every operator to the resolver and decode its options
    pub fn new(model: Model, resolver: &OpResolver) -> Result<Self, InferenceError> {
        model.validate()?;

        let subgraph_count = model.subgraphs.len();
        let mut ops = Vec::with_capacity(subgraph_count);
        for subgraph in &model.subgraphs {
            let mut prepared = Vec::with_capacity(subgraph.operators.len());
            for op in &subgraph.operators {
                if !resolver.contains(op.opcode) {
                    return Err(InferenceError::UnsupportedOp(op.opcode));
                }
                prepared.push(PreparedOp {
                    opcode: op.opcode,
                    inputs: op.inputs.clone(),
                    outputs: op.outputs.clone(),
                    options: parse_options(op, subgraph_count)?,
                });
            }
            ops.push(prepared);
        }

        debug!(
            "Interpreter ready: {} subgraphs, {} operators",
            subgraph_count,
            ops.iter().map(Vec::len).sum::<usize>()
        );

        Ok(Self {
            model,
            ops,
            plan: None,
            variables: HashMap::new(),
            variable_cursor: 0,
            initialized: HashSet::new(),
        })
    }

    fn tensor(&self, sg: usize, index: usize) -> &TensorDef {
        &self.model.subgraphs[sg].tensors[index]
    }

    fn shape(&self, sg: usize, index: usize) -> &[usize] {
        &self.tensor(sg, index).shape
    }

    fn plan(&self) -> Result<&MemoryPlan, InferenceError> {
        self.plan.as_ref().ok_or(InferenceError::NotAllocated)
    }

    fn slot(&self, sg: usize, index: usize) -> Result<(usize, usize), InferenceError> {
        let offset = self.plan()?.offsets[sg][index]
            .ok_or_else(|| InferenceError::Malformed(format!("tensor {index} is constant")))?;
        Ok((offset, tensor_size(self.tensor(sg, index))?))
    }

    fn bytes<'a>(&'a self, arena: &'a Arena, sg: usize, index: usize) -> Result<&'a [u8], InferenceError> {
        if let Some(data) = &self.tensor(sg, index).data {
            return Ok(data);
        }
        let (offset, len) = self.slot(sg, index)?;
        Ok(&arena.as_slice()[offset..offset + len])
    }

    fn bytes_mut<'a>(
        &self,
        arena: &'a mut Arena,
        sg: usize,
        index: usize,
    ) -> Result<&'a mut [u8], InferenceError> {
        let (offset, len) = self.slot(sg, index)?;
        Ok(&mut arena.as_mut_slice()[offset..offset + len])
    }

    fn affine(tensor: &TensorDef) -> (f32, i32) {
        match tensor.quantization {
            Some(q) if q.scale != 0.0 => (q.scale, q.zero_point),
            _ => (1.0, 0),
        }
    }

    /// Dequantized contents of a tensor
    fn read_values(&self, arena: &Arena, sg: usize, index: usize, op: OpCode) -> Result<Vec<f32>, InferenceError> {
        let tensor = self.tensor(sg, index);
        let bytes = self.bytes(arena, sg, index)?;
        let (scale, zero_point) = Self::affine(tensor);
        let dequantize = |q: i64| (q - zero_point as i64) as f32 * scale;

        let values: Vec<f32> = match tensor.dtype {
            DType::Int8 => bytes.iter().map(|&b| dequantize(b as i8 as i64)).collect(),
            DType::UInt8 => bytes.iter().map(|&b| dequantize(b as i64)).collect(),
            DType::Int32 => bytes
                .chunks_exact(4)
                .map(|c| dequantize(LittleEndian::read_i32(c) as i64))
                .collect(),
            DType::Float32 => bytes.chunks_exact(4).map(LittleEndian::read_f32).collect(),
            DType::Resource => {
                return Err(kernel_error(op, format!("tensor {index} is a resource handle")))
            }
        };
        Ok(values)
    }

    /// Quantize `values` into a tensor, rounding to nearest and saturating
    fn write_values(
        &self,
        arena: &mut Arena,
        sg: usize,
        index: usize,
        op: OpCode,
        values: &[f32],
    ) -> Result<(), InferenceError> {
        let tensor = self.tensor(sg, index);
        if tensor.num_elements() != Some(values.len()) {
            return Err(kernel_error(
                op,
                format!(
                    "produced {} values for tensor {index} of shape {:?}",
                    values.len(),
                    tensor.shape
                ),
            ));
        }

        let (scale, zero_point) = Self::affine(tensor);
        let quantize =
            |v: f32, min: i64, max: i64| ((v / scale).round() as i64 + zero_point as i64).clamp(min, max);
        let dtype = tensor.dtype;
        let bytes = self.bytes_mut(arena, sg, index)?;

        match dtype {
            DType::Int8 => {
                for (b, &v) in bytes.iter_mut().zip(values) {
                    *b = quantize(v, i8::MIN as i64, i8::MAX as i64) as i8 as u8;
                }
            }
            DType::UInt8 => {
                for (b, &v) in bytes.iter_mut().zip(values) {
                    *b = quantize(v, 0, u8::MAX as i64) as u8;
                }
            }
            DType::Int32 => {
                for (chunk, &v) in bytes.chunks_exact_mut(4).zip(values) {
                    LittleEndian::write_i32(chunk, quantize(v, i32::MIN as i64, i32::MAX as i64) as i32);
                }
            }
            DType::Float32 => {
                for (chunk, &v) in bytes.chunks_exact_mut(4).zip(values) {
                    LittleEndian::write_f32(chunk, v);
                }
            }
            DType::Resource => {
                return Err(kernel_error(op, format!("tensor {index} is a resource handle")))
            }
        }
        Ok(())
    }

    /// Raw int32 contents (shapes, axes, paddings)
    fn read_ints(&self, arena: &Arena, sg: usize, index: usize, op: OpCode) -> Result<Vec<i32>, InferenceError> {
        if self.tensor(sg, index).dtype != DType::Int32 {
            return Err(kernel_error(op, format!("tensor {index} must be int32")));
        }
        Ok(self
            .bytes(arena, sg, index)?
            .chunks_exact(4)
            .map(LittleEndian::read_i32)
            .collect())
    }

    fn resource_id(&self, arena: &Arena, sg: usize, index: usize, op: OpCode) -> Result<i32, InferenceError> {
        let bytes = self.bytes(arena, sg, index)?;
        if bytes.len() < 4 {
            return Err(kernel_error(op, format!("tensor {index} cannot hold a resource id")));
        }
        Ok(LittleEndian::read_i32(&bytes[..4]))
    }

    /// Find or carve the variable slot for `id`
    fn variable_slot(&mut self, id: i32, len: usize, op: OpCode) -> Result<Variable, InferenceError> {
        if let Some(variable) = self.variables.get(&id) {
            if variable.len != len {
                return Err(kernel_error(
                    op,
                    format!("variable {id} holds {} bytes, assigned {len}", variable.len),
                ));
            }
            return Ok(*variable);
        }

        let offset = align_up(self.variable_cursor, TENSOR_ALIGNMENT).unwrap_or(usize::MAX);
        if offset.checked_add(len).map_or(true, |end| end > VARIABLE_ARENA_SIZE) {
            return Err(kernel_error(
                op,
                format!("variable arena exhausted: {len} bytes at offset {offset}"),
            ));
        }
        self.variable_cursor = offset + len;

        let variable = Variable { offset, len };
        self.variables.insert(id, variable);
        debug!("Created resource variable {}: {} bytes", id, len);
        Ok(variable)
    }

    fn run_subgraph(&mut self, arena: &mut Arena, sg: usize) -> Result<(), InferenceError> {
        for position in 0..self.ops[sg].len() {
            let op = self.ops[sg][position].clone();
            trace!("subgraph {} op {}: {}", sg, position, op.opcode);
            self.execute(arena, sg, &op)?;
        }
        Ok(())
    }

    fn execute(&mut self, arena: &mut Arena, sg: usize, op: &PreparedOp) -> Result<(), InferenceError> {
        let code = op.opcode;
        let fail = move |e: KernelError| kernel_error(code, e.0);

        match (code, op.options) {
            (OpCode::CallOnce, OpOptions::CallOnce { subgraph }) => {
                if self.initialized.insert(subgraph) {
                    debug!("Running init subgraph {}", subgraph);
                    self.run_subgraph(arena, subgraph)?;
                }
            }

            (OpCode::VarHandle, OpOptions::VarHandle { resource_id }) => {
                let bytes = self.bytes_mut(arena, sg, op.output(0)?)?;
                if bytes.len() < 4 {
                    return Err(kernel_error(code, "handle tensor cannot hold a resource id"));
                }
                LittleEndian::write_i32(&mut bytes[..4], resource_id);
            }

            (OpCode::AssignVariable, _) => {
                let id = self.resource_id(arena, sg, op.input(0)?, code)?;
                let value = self.bytes(arena, sg, op.input(1)?)?.to_vec();
                let variable = self.variable_slot(id, value.len(), code)?;
                let start = self.plan()?.variable_base + variable.offset;
                arena.as_mut_slice()[start..start + variable.len].copy_from_slice(&value);
            }

            (OpCode::ReadVariable, _) => {
                let id = self.resource_id(arena, sg, op.input(0)?, code)?;
                let variable = self
                    .variables
                    .get(&id)
                    .copied()
                    .ok_or_else(|| kernel_error(code, format!("variable {id} was never assigned")))?;
                let start = self.plan()?.variable_base + variable.offset;
                let value = arena.as_slice()[start..start + variable.len].to_vec();

                let target = self.bytes_mut(arena, sg, op.output(0)?)?;
                if target.len() != value.len() {
                    return Err(kernel_error(
                        code,
                        format!("variable {id} holds {} bytes, output needs {}", value.len(), target.len()),
                    ));
                }
                target.copy_from_slice(&value);
            }

            (OpCode::Reshape | OpCode::Quantize, _) => {
                let values = self.read_values(arena, sg, op.input(0)?, code)?;
                self.write_values(arena, sg, op.output(0)?, code, &values)?;
            }

            (OpCode::Logistic, _) => {
                let mut values = self.read_values(arena, sg, op.input(0)?, code)?;
                kernels::logistic(&mut values);
                self.write_values(arena, sg, op.output(0)?, code, &values)?;
            }

            (OpCode::Add | OpCode::Mul, OpOptions::Fused(activation)) => {
                let (lhs, rhs, out) = (op.input(0)?, op.input(1)?, op.output(0)?);
                let a = self.read_values(arena, sg, lhs, code)?;
                let b = self.read_values(arena, sg, rhs, code)?;
                let combine: fn(f32, f32) -> f32 = if code == OpCode::Add {
                    |x, y| x + y
                } else {
                    |x, y| x * y
                };
                let mut values = kernels::broadcast_binary(
                    &a,
                    self.shape(sg, lhs),
                    &b,
                    self.shape(sg, rhs),
                    self.shape(sg, out),
                    combine,
                )
                .map_err(fail)?;
                kernels::apply_activation(&mut values, activation);
                self.write_values(arena, sg, out, code, &values)?;
            }

            (OpCode::FullyConnected, OpOptions::Fused(activation)) => {
                let input = self.read_values(arena, sg, op.input(0)?, code)?;
                let filter_index = op.input(1)?;
                let filter = self.read_values(arena, sg, filter_index, code)?;
                let bias = match op.optional_input(2) {
                    Some(index) => Some(self.read_values(arena, sg, index, code)?),
                    None => None,
                };
                let values = kernels::fully_connected(
                    &input,
                    &filter,
                    self.shape(sg, filter_index),
                    bias.as_deref(),
                    activation,
                )
                .map_err(fail)?;
                self.write_values(arena, sg, op.output(0)?, code, &values)?;
            }

            (OpCode::Conv2D, OpOptions::Conv(window)) => {
                let (input_index, filter_index, out) = (op.input(0)?, op.input(1)?, op.output(0)?);
                let input = self.read_values(arena, sg, input_index, code)?;
                let filter = self.read_values(arena, sg, filter_index, code)?;
                let bias = match op.optional_input(2) {
                    Some(index) => Some(self.read_values(arena, sg, index, code)?),
                    None => None,
                };
                let values = kernels::conv2d(
                    &input,
                    self.shape(sg, input_index),
                    &filter,
                    self.shape(sg, filter_index),
                    bias.as_deref(),
                    self.shape(sg, out),
                    &window,
                )
                .map_err(fail)?;
                self.write_values(arena, sg, out, code, &values)?;
            }

            (
                OpCode::DepthwiseConv2D,
                OpOptions::DepthwiseConv {
                    window,
                    depth_multiplier,
                },
            ) => {
                let (input_index, filter_index, out) = (op.input(0)?, op.input(1)?, op.output(0)?);
                let input = self.read_values(arena, sg, input_index, code)?;
                let filter = self.read_values(arena, sg, filter_index, code)?;
                let bias = match op.optional_input(2) {
                    Some(index) => Some(self.read_values(arena, sg, index, code)?),
                    None => None,
                };
                let values = kernels::depthwise_conv2d(
                    &input,
                    self.shape(sg, input_index),
                    &filter,
                    self.shape(sg, filter_index),
                    bias.as_deref(),
                    self.shape(sg, out),
                    depth_multiplier,
                    &window,
                )
                .map_err(fail)?;
                self.write_values(arena, sg, out, code, &values)?;
            }

            (
                OpCode::AveragePool2D | OpCode::MaxPool2D,
                OpOptions::Pool {
                    window,
                    filter_h,
                    filter_w,
                },
            ) => {
                let (input_index, out) = (op.input(0)?, op.output(0)?);
                let input = self.read_values(arena, sg, input_index, code)?;
                let kind = if code == OpCode::MaxPool2D {
                    PoolKind::Max
                } else {
                    PoolKind::Average
                };
                let values = kernels::pool2d(
                    &input,
                    self.shape(sg, input_index),
                    self.shape(sg, out),
                    filter_h,
                    filter_w,
                    &window,
                    kind,
                )
                .map_err(fail)?;
                self.write_values(arena, sg, out, code, &values)?;
            }

            (OpCode::Mean, OpOptions::Mean { keep_dims }) => {
                trace!("mean keep_dims={}", keep_dims);
                let input_index = op.input(0)?;
                let input = self.read_values(arena, sg, input_index, code)?;
                let axes = self.read_ints(arena, sg, op.input(1)?, code)?;
                let values =
                    kernels::mean(&input, self.shape(sg, input_index), &axes).map_err(fail)?;
                self.write_values(arena, sg, op.output(0)?, code, &values)?;
            }

            (OpCode::StridedSlice, OpOptions::StridedSlice { begin_mask, end_mask }) => {
                let input_index = op.input(0)?;
                let input = self.read_values(arena, sg, input_index, code)?;
                let begin = self.read_ints(arena, sg, op.input(1)?, code)?;
                let end = self.read_ints(arena, sg, op.input(2)?, code)?;
                let strides = self.read_ints(arena, sg, op.input(3)?, code)?;
                let values = kernels::strided_slice(
                    &input,
                    self.shape(sg, input_index),
                    &begin,
                    &end,
                    &strides,
                    begin_mask,
                    end_mask,
                )
                .map_err(fail)?;
                self.write_values(arena, sg, op.output(0)?, code, &values)?;
            }

            (OpCode::Concatenation, OpOptions::Concatenation { axis, activation }) => {
                let indices: Vec<usize> = op.inputs.iter().flatten().copied().collect();
                let first = *indices
                    .first()
                    .ok_or_else(|| kernel_error(code, "no inputs"))?;
                let axis = kernels::normalize_axis(axis, self.shape(sg, first).len()).map_err(fail)?;

                let mut data = Vec::with_capacity(indices.len());
                for &index in &indices {
                    data.push(self.read_values(arena, sg, index, code)?);
                }
                let parts: Vec<(&[f32], &[usize])> = data
                    .iter()
                    .zip(&indices)
                    .map(|(values, &index)| (values.as_slice(), self.shape(sg, index)))
                    .collect();

                let mut values = kernels::concatenate(&parts, axis).map_err(fail)?;
                kernels::apply_activation(&mut values, activation);
                self.write_values(arena, sg, op.output(0)?, code, &values)?;
            }

            (OpCode::Pack, OpOptions::Pack { axis }) => {
                let indices: Vec<usize> = op.inputs.iter().flatten().copied().collect();
                let first = *indices
                    .first()
                    .ok_or_else(|| kernel_error(code, "no inputs"))?;
                let shape = self.shape(sg, first);
                if indices.iter().any(|&index| self.shape(sg, index) != shape) {
                    return Err(kernel_error(code, "inputs must share one shape"));
                }
                let axis = kernels::normalize_axis(axis, shape.len() + 1).map_err(fail)?;

                let mut data = Vec::with_capacity(indices.len());
                for &index in &indices {
                    data.push(self.read_values(arena, sg, index, code)?);
                }
                let parts: Vec<&[f32]> = data.iter().map(Vec::as_slice).collect();

                let values = kernels::pack(&parts, shape, axis).map_err(fail)?;
                self.write_values(arena, sg, op.output(0)?, code, &values)?;
            }

            (OpCode::SplitV, _) => {
                let input_index = op.input(0)?;
                let input = self.read_values(arena, sg, input_index, code)?;
                let requested = self.read_ints(arena, sg, op.input(1)?, code)?;
                let axis = self
                    .read_ints(arena, sg, op.input(2)?, code)?
                    .first()
                    .copied()
                    .ok_or_else(|| kernel_error(code, "missing split axis"))?;

                let in_shape = self.shape(sg, input_index);
                let axis = kernels::normalize_axis(axis, in_shape.len()).map_err(fail)?;
                let sizes = resolve_split_sizes(&requested, in_shape[axis])
                    .ok_or_else(|| kernel_error(code, format!("invalid split sizes {requested:?}")))?;
                if sizes.len() != op.outputs.len() {
                    return Err(kernel_error(
                        code,
                        format!("{} sizes for {} outputs", sizes.len(), op.outputs.len()),
                    ));
                }

                let pieces = kernels::split(&input, in_shape, axis, &sizes).map_err(fail)?;
                for (piece, &out) in pieces.iter().zip(&op.outputs) {
                    self.write_values(arena, sg, out, code, piece)?;
                }
            }

            (OpCode::Pad, _) => {
                let input_index = op.input(0)?;
                let input = self.read_values(arena, sg, input_index, code)?;
                let paddings = self.read_ints(arena, sg, op.input(1)?, code)?;
                let pairs = paddings
                    .chunks_exact(2)
                    .map(|pair| match (usize::try_from(pair[0]), usize::try_from(pair[1])) {
                        (Ok(before), Ok(after)) => Some((before, after)),
                        _ => None,
                    })
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| kernel_error(code, "paddings must be non-negative"))?;

                let values =
                    kernels::pad(&input, self.shape(sg, input_index), &pairs, 0.0).map_err(fail)?;
                self.write_values(arena, sg, op.output(0)?, code, &values)?;
            }

            (opcode, options) => {
                return Err(InferenceError::InvalidOptions {
                    op: opcode,
                    reason: format!("unexpected options {options:?}"),
                })
            }
        }

        Ok(())
    }
}

/// Expand a single `-1` entry to whatever remains of `dim`
fn resolve_split_sizes(requested: &[i32], dim: usize) -> Option<Vec<usize>> {
    let known: usize = requested
        .iter()
        .filter(|&&s| s >= 0)
        .map(|&s| s as usize)
        .sum();
    let inferred = requested.iter().filter(|&&s| s < 0).count();

    match inferred {
        0 if known == dim => Some(requested.iter().map(|&s| s as usize).collect()),
        1 if known <= dim => Some(
            requested
                .iter()
                .map(|&s| if s < 0 { dim - known } else { s as usize })
                .collect(),
        ),
        _ => None,
    }
}

impl Interpreter for MicroInterpreter {
    fn allocate_tensors(&mut self, arena: &mut Arena) -> Result<(), InferenceError> {
        let unaddressable =
            || InferenceError::Malformed("tensor plan exceeds addressable memory".to_string());

        let mut cursor: usize = 0;
        let mut offsets = Vec::with_capacity(self.model.subgraphs.len());
        for subgraph in &self.model.subgraphs {
            let mut slots = Vec::with_capacity(subgraph.tensors.len());
            for tensor in &subgraph.tensors {
                if tensor.is_constant() {
                    slots.push(None);
                } else {
                    let offset = align_up(cursor, TENSOR_ALIGNMENT).ok_or_else(unaddressable)?;
                    cursor = offset
                        .checked_add(tensor_size(tensor)?)
                        .ok_or_else(unaddressable)?;
                    slots.push(Some(offset));
                }
            }
            offsets.push(slots);
        }

        let variable_base = align_up(cursor, TENSOR_ALIGNMENT).ok_or_else(unaddressable)?;
        let required = variable_base
            .checked_add(VARIABLE_ARENA_SIZE)
            .ok_or_else(unaddressable)?;
        if required > arena.len() {
            return Err(InferenceError::ArenaExhausted {
                required,
                available: arena.len(),
            });
        }

        arena.clear();
        self.plan = Some(MemoryPlan {
            offsets,
            variable_base,
            used_bytes: required,
        });
        self.variables.clear();
        self.variable_cursor = 0;
        self.initialized.clear();

        debug!("Tensor plan uses {} of {} arena bytes", required, arena.len());
        Ok(())
    }

    fn input_dims(&self) -> Vec<usize> {
        self.model
            .subgraphs
            .first()
            .and_then(|sg| sg.inputs.first().map(|&index| sg.tensors[index].shape.clone()))
            .unwrap_or_default()
    }

    fn write_input(&mut self, arena: &mut Arena, offset: usize, data: &[i8]) -> Result<(), InferenceError> {
        let index = self
            .model
            .subgraphs
            .first()
            .and_then(|sg| sg.inputs.first().copied())
            .ok_or_else(|| InferenceError::Malformed("model has no input".to_string()))?;

        let tensor = self.tensor(0, index);
        if tensor.dtype != DType::Int8 {
            return Err(InferenceError::UnsupportedType(tensor.dtype));
        }
        let size = tensor_size(tensor)?;
        if offset.checked_add(data.len()).map_or(true, |end| end > size) {
            return Err(InferenceError::InputOutOfRange {
                offset,
                len: data.len(),
                size,
            });
        }

        let bytes = self.bytes_mut(arena, 0, index)?;
        for (slot, &value) in bytes[offset..offset + data.len()].iter_mut().zip(data) {
            *slot = value as u8;
        }
        Ok(())
    }

    fn invoke(&mut self, arena: &mut Arena) -> Result<(), InferenceError> {
        self.plan()?;
        self.run_subgraph(arena, 0)
    }

    fn output(&self, arena: &Arena) -> Result<OutputTensor, InferenceError> {
        let index = self
            .model
            .subgraphs
            .first()
            .and_then(|sg| sg.outputs.first().copied())
            .ok_or_else(|| InferenceError::Malformed("model has no output".to_string()))?;

        let tensor = self.tensor(0, index);
        let bytes = self.bytes(arena, 0, index)?;
        if bytes.is_empty() {
            return Err(InferenceError::Malformed("output tensor is empty".to_string()));
        }

        let value = match tensor.dtype {
            DType::Float32 => OutputValue::Float32(LittleEndian::read_f32(&bytes[..4])),
            DType::Int8 => OutputValue::Int8(bytes[0] as i8),
            DType::UInt8 => OutputValue::UInt8(bytes[0]),
            other => return Err(InferenceError::UnsupportedType(other)),
        };

        Ok(OutputTensor {
            value,
            quantization: tensor.quantization,
        })
    }

    fn arena_used_bytes(&self) -> usize {
        self.plan.as_ref().map_or(0, |plan| plan.used_bytes)
    }
}
