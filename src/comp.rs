// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Host reduction primitive
//!
//! `reduce` folds `src` into `dst` element-wise. It is the only arithmetic
//! the scheduler needs; accelerator reductions plug in behind the same
//! contract.

use crate::data_types::{Datatype, ReduceOp};
use crate::error::{CclError, CclResult};

macro_rules! reduce_elems {
    ($t:ty, $dst:expr, $src:expr, |$x:ident, $y:ident| $body:expr) => {{
        const W: usize = std::mem::size_of::<$t>();
        for (d, s) in $dst.chunks_exact_mut(W).zip($src.chunks_exact(W)) {
            let mut a = [0u8; W];
            let mut b = [0u8; W];
            a.copy_from_slice(d);
            b.copy_from_slice(s);
            let $x = <$t>::from_ne_bytes(a);
            let $y = <$t>::from_ne_bytes(b);
            let r: $t = $body;
            d.copy_from_slice(&r.to_ne_bytes());
        }
    }};
}

macro_rules! reduce_int {
    ($t:ty, $dst:expr, $src:expr, $op:expr) => {
        match $op {
            ReduceOp::Sum => reduce_elems!($t, $dst, $src, |x, y| x.wrapping_add(y)),
            ReduceOp::Prod => reduce_elems!($t, $dst, $src, |x, y| x.wrapping_mul(y)),
            ReduceOp::Min => reduce_elems!($t, $dst, $src, |x, y| x.min(y)),
            ReduceOp::Max => reduce_elems!($t, $dst, $src, |x, y| x.max(y)),
        }
    };
}

macro_rules! reduce_float {
    ($t:ty, $dst:expr, $src:expr, $op:expr) => {
        match $op {
            ReduceOp::Sum => reduce_elems!($t, $dst, $src, |x, y| x + y),
            ReduceOp::Prod => reduce_elems!($t, $dst, $src, |x, y| x * y),
            ReduceOp::Min => reduce_elems!($t, $dst, $src, |x, y| x.min(y)),
            ReduceOp::Max => reduce_elems!($t, $dst, $src, |x, y| x.max(y)),
        }
    };
}

/// Reduce `src` into `dst` in place: `dst[i] = op(dst[i], src[i])`
pub fn reduce(dst: &mut [u8], src: &[u8], dtype: Datatype, op: ReduceOp) -> CclResult<()> {
    if dst.len() != src.len() {
        return Err(CclError::invalid(format!(
            "reduce length mismatch: dst {} bytes, src {} bytes",
            dst.len(),
            src.len()
        )));
    }
    if dst.len() % dtype.size() != 0 {
        return Err(CclError::invalid(format!(
            "reduce length {} is not a multiple of {} element size",
            dst.len(),
            dtype
        )));
    }

    // integer overflow wraps, matching device reductions
    match dtype {
        Datatype::Int8 => reduce_int!(i8, dst, src, op),
        Datatype::UInt8 => reduce_int!(u8, dst, src, op),
        Datatype::Int32 => reduce_int!(i32, dst, src, op),
        Datatype::UInt32 => reduce_int!(u32, dst, src, op),
        Datatype::Int64 => reduce_int!(i64, dst, src, op),
        Datatype::UInt64 => reduce_int!(u64, dst, src, op),
        Datatype::Float32 => reduce_float!(f32, dst, src, op),
        Datatype::Float64 => reduce_float!(f64, dst, src, op),
    }
    Ok(())
}
