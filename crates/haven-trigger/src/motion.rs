use bytes::Bytes;

/// Minimum hash distance, in bits, treated as motion.
pub const MOTION_THRESHOLD: u32 = 4;

/// 64-bit perceptual hash over raw frame bytes: a 256-bucket byte histogram
/// collapsed into 64 groups, each bit set when its group carries more than an
/// even share. Insensitive to compression noise, sensitive to gross
/// brightness/content shifts, and needs no image decoding.
pub fn frame_hash(bytes: &[u8]) -> u64 {
    if bytes.is_empty() {
        return 0;
    }

    let mut histogram = [0u64; 256];
    for &b in bytes {
        histogram[b as usize] += 1;
    }

    let mut groups = [0u64; 64];
    for (bucket, count) in histogram.iter().enumerate() {
        groups[bucket / 4] += count;
    }

    let mean = bytes.len() as u64 / 64;
    let mut hash = 0u64;
    for (i, &group) in groups.iter().enumerate() {
        if group > mean {
            hash |= 1 << i;
        }
    }
    hash
}

pub fn hash_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Motion check over a frame sequence: compare the first and last frame.
/// Fewer than two frames can never show motion.
pub fn has_motion(frames: &[Bytes]) -> bool {
    let (Some(first), Some(last)) = (frames.first(), frames.last()) else {
        return false;
    };
    if frames.len() < 2 {
        return false;
    }
    hash_distance(frame_hash(first), frame_hash(last)) >= MOTION_THRESHOLD
}
