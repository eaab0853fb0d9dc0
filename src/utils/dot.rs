//! SIMD-aware dot-product kernels shared by the baseline network and the engine.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DotKernel {
    Scalar,
    #[cfg(target_arch = "x86_64")]
    Avx2Fma,
}

impl DotKernel {
    #[inline(always)]
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            if std::is_x86_feature_detected!("avx2") && std::is_x86_feature_detected!("fma") {
                return DotKernel::Avx2Fma;
            }
        }

        DotKernel::Scalar
    }
}

/// f32 dot product over the common prefix of `a` and `b`.
#[inline(always)]
pub fn dot(kernel: DotKernel, a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    match kernel {
        DotKernel::Scalar => dot_scalar(&a[..len], &b[..len]),
        // SAFETY: the variant is only produced by `detect` after checking avx2 and fma,
        // and both pointers are valid for `len` reads.
        #[cfg(target_arch = "x86_64")]
        DotKernel::Avx2Fma => unsafe { x86_64::dot_avx2_fma_impl(a.as_ptr(), b.as_ptr(), len) },
    }
}

#[inline(always)]
fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut sums = [0.0f32; 4];
    let chunks_a = a.chunks_exact(4);
    let chunks_b = b.chunks_exact(4);
    let tail_a = chunks_a.remainder();
    let tail_b = chunks_b.remainder();

    for (ca, cb) in chunks_a.zip(chunks_b) {
        sums[0] = ca[0].mul_add(cb[0], sums[0]);
        sums[1] = ca[1].mul_add(cb[1], sums[1]);
        sums[2] = ca[2].mul_add(cb[2], sums[2]);
        sums[3] = ca[3].mul_add(cb[3], sums[3]);
    }

    let mut sum = (sums[0] + sums[1]) + (sums[2] + sums[3]);
    for (&av, &bv) in tail_a.iter().zip(tail_b) {
        sum = av.mul_add(bv, sum);
    }
    sum
}

/// Integer dot product with an i32 accumulator, as int8 tensor cores do.
#[inline(always)]
pub fn dot_i8(a: &[i8], b: &[i8]) -> i32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| x as i32 * y as i32)
        .sum()
}

#[cfg(target_arch = "x86_64")]
mod x86_64 {
    use core::arch::x86_64::*;

    #[target_feature(enable = "avx2,fma")]
    pub(super) unsafe fn dot_avx2_fma_impl(a: *const f32, b: *const f32, len: usize) -> f32 {
        unsafe fn hsum256(v: __m256) -> f32 {
            let mut tmp = [0.0f32; 8];
            unsafe { _mm256_storeu_ps(tmp.as_mut_ptr(), v) };
            (tmp[0] + tmp[1]) + (tmp[2] + tmp[3]) + (tmp[4] + tmp[5]) + (tmp[6] + tmp[7])
        }

        let mut acc = _mm256_setzero_ps();
        let mut i = 0usize;

        while i + 8 <= len {
            let va = unsafe { _mm256_loadu_ps(a.add(i)) };
            let vb = unsafe { _mm256_loadu_ps(b.add(i)) };
            acc = _mm256_fmadd_ps(va, vb, acc);
            i += 8;
        }

        let mut sum = unsafe { hsum256(acc) };
        while i < len {
            let av = unsafe { *a.add(i) };
            let bv = unsafe { *b.add(i) };
            sum = av.mul_add(bv, sum);
            i += 1;
        }

        sum
    }
}
