// SPDX-License-Identifier: AGPL-3.0-or-later
//
// d-dimensional Hilbert index over integer coordinates (Skilling's
// transpose algorithm). Used to order sparse cells when the schema cell
// order is Hilbert.

/// Bits available per dimension so that `dim_num * bits` fits in `u64`.
pub fn bits_per_dim(dim_num: usize) -> u32 {
    (64 / dim_num as u32).max(1)
}

/// Maps a coordinate into its Hilbert bucket in `[0, 2^bits)`.
///
/// Domains narrower than `2^bits` map one-to-one; wider domains are
/// divided into equal-width buckets.
pub fn coord_bucket(x: i64, domain: (i64, i64), bits: u32) -> u64 {
    let off = (x as i128 - domain.0 as i128) as u128;
    let range = (domain.1 as i128 - domain.0 as i128) as u128 + 1;
    if bits >= 64 || range <= (1u128 << bits) {
        return off as u64;
    }
    let bucket_size = range.div_ceil(1u128 << bits);
    (off / bucket_size) as u64
}

/// Computes the Hilbert index of one cell.
///
/// `axes` holds one bucketed value per dimension, each below `2^bits`,
/// with `axes.len() * bits <= 64`.
pub fn hilbert_index(axes: &[u64], bits: u32) -> u64 {
    debug_assert!(axes.len() as u32 * bits <= 64);
    let mut x = axes.to_vec();
    axes_to_transpose(&mut x, bits);

    // Interleave the transpose form, most significant bit level first.
    let mut index = 0u64;
    for b in (0..bits).rev() {
        for xi in &x {
            index = (index << 1) | ((xi >> b) & 1);
        }
    }
    index
}

fn axes_to_transpose(x: &mut [u64], bits: u32) {
    let n = x.len();
    let m = 1u64 << (bits - 1);

    // Inverse undo.
    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..n {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }

    // Gray encode.
    for i in 1..n {
        x[i] ^= x[i - 1];
    }
    let mut t = 0u64;
    let mut q = m;
    while q > 1 {
        if x[n - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for xi in x.iter_mut() {
        *xi ^= t;
    }
}
