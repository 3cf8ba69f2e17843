//! 長さでバケット化した分散サンプラ
//!
//! 各バケットのサンプル数を `batch_size * num_replicas` の倍数まで水増しし、
//! ランクごとに互いに素なバッチ列を返す。

use crate::error::{Result, TrainError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

pub struct DistributedBucketSampler {
    buckets: Vec<Vec<usize>>,
    num_samples_per_bucket: Vec<usize>,
    batch_size: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    epoch: u64,
    num_samples: usize,
}

impl DistributedBucketSampler {
    /// `lengths[i]` はサンプル i のスペクトログラム長。
    /// `boundaries[k] < len <= boundaries[k+1]` を満たすバケットに入らないサンプルは捨てる。
    pub fn new(
        lengths: &[usize],
        batch_size: usize,
        boundaries: &[usize],
        num_replicas: usize,
        rank: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 || num_replicas == 0 || rank >= num_replicas {
            return Err(TrainError::Data(format!(
                "invalid sampler setup: batch_size {} rank {} of {}",
                batch_size, rank, num_replicas
            )));
        }
        let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); boundaries.len().saturating_sub(1)];
        let mut dropped = 0usize;
        for (i, &len) in lengths.iter().enumerate() {
            match bisect(boundaries, len) {
                Some(b) => buckets[b].push(i),
                None => dropped += 1,
            }
        }
        buckets.retain(|b| !b.is_empty());
        if buckets.is_empty() {
            return Err(TrainError::Data(format!(
                "no sample length falls inside bucket boundaries {:?}",
                boundaries
            )));
        }
        if dropped > 0 {
            tracing::debug!(dropped, "samples outside bucket boundaries");
        }

        let total_batch = batch_size * num_replicas;
        let num_samples_per_bucket: Vec<usize> = buckets
            .iter()
            .map(|b| {
                let rem = (total_batch - b.len() % total_batch) % total_batch;
                b.len() + rem
            })
            .collect();
        let total: usize = num_samples_per_bucket.iter().sum();

        Ok(Self {
            buckets,
            num_samples_per_bucket,
            batch_size,
            num_replicas,
            rank,
            shuffle,
            seed,
            epoch: 0,
            num_samples: total / num_replicas,
        })
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// このランクが 1 エポックで受け取るバッチ数
    pub fn len(&self) -> usize {
        self.num_samples / self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 現在のエポックのバッチ列。同じ (seed, epoch) なら全ランクで同じ並びから分配される。
    pub fn batches(&self) -> Vec<Vec<usize>> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
        let mut batches = Vec::with_capacity(self.len());

        for (bucket, &num_samples) in self.buckets.iter().zip(&self.num_samples_per_bucket) {
            let mut order: Vec<usize> = (0..bucket.len()).collect();
            if self.shuffle {
                order.shuffle(&mut rng);
            }
            // 末尾を先頭から巡回して埋める
            let mut ids: Vec<usize> = Vec::with_capacity(num_samples);
            while ids.len() < num_samples {
                let take = (num_samples - ids.len()).min(order.len());
                ids.extend_from_slice(&order[..take]);
            }
            let ids: Vec<usize> = ids
                .into_iter()
                .skip(self.rank)
                .step_by(self.num_replicas)
                .collect();
            for chunk in ids.chunks_exact(self.batch_size) {
                batches.push(chunk.iter().map(|&j| bucket[j]).collect());
            }
        }

        if self.shuffle {
            batches.shuffle(&mut rng);
        }
        batches
    }
}

/// `boundaries[k] < x <= boundaries[k+1]` となる k
fn bisect(boundaries: &[usize], x: usize) -> Option<usize> {
    boundaries
        .windows(2)
        .position(|w| w[0] < x && x <= w[1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const BOUNDARIES: [usize; 4] = [32, 100, 200, 300];

    fn lengths() -> Vec<usize> {
        // 40 サンプル: 3 バケットに分散、2 個は範囲外
        let mut v: Vec<usize> = (0..38).map(|i| 40 + (i * 7) % 250).collect();
        v.push(10);
        v.push(1000);
        v
    }

    #[test]
    fn test_bisect() {
        assert_eq!(bisect(&BOUNDARIES, 32), None);
        assert_eq!(bisect(&BOUNDARIES, 33), Some(0));
        assert_eq!(bisect(&BOUNDARIES, 100), Some(0));
        assert_eq!(bisect(&BOUNDARIES, 101), Some(1));
        assert_eq!(bisect(&BOUNDARIES, 301), None);
    }

    #[test]
    fn test_ranks_are_disjoint_and_cover_lengths() -> Result<()> {
        let lengths = lengths();
        let mut seen: Vec<HashSet<usize>> = Vec::new();
        for rank in 0..2 {
            let mut s = DistributedBucketSampler::new(&lengths, 4, &BOUNDARIES, 2, rank, true, 7)?;
            s.set_epoch(3);
            let batches = s.batches();
            assert_eq!(batches.len(), s.len());
            for b in &batches {
                assert_eq!(b.len(), 4);
                // 同じバッチ内は同じバケット
                let bucket = bisect(&BOUNDARIES, lengths[b[0]]);
                assert!(b.iter().all(|&i| bisect(&BOUNDARIES, lengths[i]) == bucket));
            }
            seen.push(batches.into_iter().flatten().collect());
        }
        // 範囲外の 2 サンプル以外はどこかのランクに現れる
        let all: HashSet<usize> = seen[0].union(&seen[1]).copied().collect();
        assert!(!all.contains(&38));
        assert!(!all.contains(&39));
        assert_eq!(all.len(), 38);
        Ok(())
    }

    #[test]
    fn test_disjoint_without_padding() -> Result<()> {
        // 各バケットちょうど 8 サンプル -> 水増しなし
        let lengths: Vec<usize> = (0..16).map(|i| if i < 8 { 50 } else { 150 }).collect();
        let a = DistributedBucketSampler::new(&lengths, 2, &BOUNDARIES, 2, 0, true, 1)?.batches();
        let b = DistributedBucketSampler::new(&lengths, 2, &BOUNDARIES, 2, 1, true, 1)?.batches();
        let a: HashSet<usize> = a.into_iter().flatten().collect();
        let b: HashSet<usize> = b.into_iter().flatten().collect();
        assert!(a.is_disjoint(&b));
        assert_eq!(a.len() + b.len(), 16);
        Ok(())
    }

    #[test]
    fn test_epoch_reseeds_deterministically() -> Result<()> {
        let lengths = lengths();
        let mut s = DistributedBucketSampler::new(&lengths, 2, &BOUNDARIES, 1, 0, true, 42)?;
        s.set_epoch(1);
        let first = s.batches();
        assert_eq!(first, s.batches());
        s.set_epoch(2);
        assert_ne!(first, s.batches());
        Ok(())
    }

    #[test]
    fn test_no_shuffle_keeps_order() -> Result<()> {
        let lengths = vec![50, 60, 70, 80];
        let s = DistributedBucketSampler::new(&lengths, 2, &BOUNDARIES, 1, 0, false, 0)?;
        assert_eq!(s.batches(), vec![vec![0, 1], vec![2, 3]]);
        Ok(())
    }

    #[test]
    fn test_rejects_invalid_setup() {
        assert!(DistributedBucketSampler::new(&[50], 0, &BOUNDARIES, 1, 0, true, 0).is_err());
        assert!(DistributedBucketSampler::new(&[50], 1, &BOUNDARIES, 2, 2, true, 0).is_err());
        assert!(DistributedBucketSampler::new(&[5], 1, &BOUNDARIES, 1, 0, true, 0).is_err());
    }
}
