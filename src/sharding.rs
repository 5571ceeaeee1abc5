/// Maps a raw metric id onto a shard in `[0, num_shards)`.
///
/// Must be pure and stable across processes: every instance in the cluster
/// has to agree on the owner of a given id for a given total shard count.
pub type ShardFn = fn(&[u8], u32) -> u32;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Default shard function: FNV-1a over the id bytes, modulo the shard count.
pub fn fnv1a_shard_fn(id: &[u8], num_shards: u32) -> u32 {
    if num_shards == 0 {
        return 0;
    }
    let mut hash = FNV_OFFSET;
    for b in id {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % u64::from(num_shards)) as u32
}
