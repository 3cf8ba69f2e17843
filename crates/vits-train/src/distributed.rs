//! プロセスグループと計算デバイスの束縛
//!
//! ランク 0 が固定アドレスで待ち受け、他のランクが接続するスター型の TCP 実装。
//! 勾配の平均化は `DistributedContext::backward` の中で行う。

use crate::config::{DeviceKind, HParams};
use crate::error::{Result, TrainError};
use crate::nets::Network;
use crate::optim::GradMap;
use candle_core::{DType, Device, Tensor};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

/// 集団通信の最小インターフェース
pub trait ProcessGroup: Send {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
    /// 全ランクの `data` を要素ごとに平均し、結果を全ランクに配る
    fn all_reduce_mean(&mut self, data: &mut [f32]) -> Result<()>;
    /// ランク 0 の `data` で全ランクを上書きする
    fn broadcast(&mut self, data: &mut [f32]) -> Result<()>;
    fn barrier(&mut self) -> Result<()>;
    fn destroy(&mut self) -> Result<()>;
}

pub struct TcpProcessGroup {
    rank: usize,
    world_size: usize,
    /// ランク 0 ではランク 1.. への接続、他のランクではランク 0 への接続 1 本
    peers: Vec<TcpStream>,
}

fn dist_err(context: &str, e: impl std::fmt::Display) -> TrainError {
    TrainError::Distributed(format!("{}: {}", context, e))
}

fn send_buf(stream: &mut TcpStream, data: &[f32]) -> Result<()> {
    let mut bytes = Vec::with_capacity(8 + data.len() * 4);
    bytes.extend_from_slice(&(data.len() as u64).to_le_bytes());
    for v in data {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    stream.write_all(&bytes).map_err(|e| dist_err("send", e))
}

fn recv_buf(stream: &mut TcpStream, expected: usize) -> Result<Vec<f32>> {
    let mut len = [0u8; 8];
    stream.read_exact(&mut len).map_err(|e| dist_err("receive", e))?;
    let len = u64::from_le_bytes(len) as usize;
    if len != expected {
        return Err(TrainError::Distributed(format!(
            "all-reduce size mismatch: got {} values, expected {}",
            len, expected
        )));
    }
    let mut bytes = vec![0u8; len * 4];
    stream.read_exact(&mut bytes).map_err(|e| dist_err("receive", e))?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

impl TcpProcessGroup {
    /// ランクに応じて待ち受けまたは接続する。相手が現れるまで無期限に待つ。
    pub fn connect(addr: &str, rank: usize, world_size: usize) -> Result<Self> {
        if rank == 0 {
            let listener = TcpListener::bind(addr).map_err(|e| dist_err(&format!("bind {}", addr), e))?;
            Self::host(listener, world_size)
        } else {
            Self::join(addr, rank, world_size)
        }
    }

    /// ランク 0: `world_size - 1` 個の接続を受け付ける
    pub fn host(listener: TcpListener, world_size: usize) -> Result<Self> {
        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        for _ in 1..world_size {
            let (mut stream, peer) = listener.accept().map_err(|e| dist_err("accept", e))?;
            stream.set_nodelay(true).map_err(|e| dist_err("set_nodelay", e))?;
            let mut hello = [0u8; 8];
            stream.read_exact(&mut hello).map_err(|e| dist_err("handshake", e))?;
            let rank = u64::from_le_bytes(hello) as usize;
            match slots.get_mut(rank.wrapping_sub(1)) {
                Some(slot @ None) => *slot = Some(stream),
                _ => {
                    return Err(TrainError::Distributed(format!(
                        "unexpected rank {} from {}",
                        rank, peer
                    )))
                }
            }
            tracing::debug!(rank, %peer, "peer joined");
        }
        let peers = slots.into_iter().flatten().collect();
        Ok(Self {
            rank: 0,
            world_size,
            peers,
        })
    }

    /// ランク 1..: ランク 0 に接続できるまで再試行する
    pub fn join(addr: &str, rank: usize, world_size: usize) -> Result<Self> {
        let mut stream = loop {
            match TcpStream::connect(addr) {
                Ok(s) => break s,
                Err(_) => std::thread::sleep(Duration::from_millis(100)),
            }
        };
        stream.set_nodelay(true).map_err(|e| dist_err("set_nodelay", e))?;
        stream
            .write_all(&(rank as u64).to_le_bytes())
            .map_err(|e| dist_err("handshake", e))?;
        Ok(Self {
            rank,
            world_size,
            peers: vec![stream],
        })
    }
}

impl ProcessGroup for TcpProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_mean(&mut self, data: &mut [f32]) -> Result<()> {
        if self.world_size <= 1 {
            return Ok(());
        }
        if self.rank == 0 {
            let mut sum: Vec<f32> = data.to_vec();
            for peer in self.peers.iter_mut() {
                let buf = recv_buf(peer, data.len())?;
                for (s, v) in sum.iter_mut().zip(buf) {
                    *s += v;
                }
            }
            let n = self.world_size as f32;
            for (d, s) in data.iter_mut().zip(&sum) {
                *d = s / n;
            }
            for peer in self.peers.iter_mut() {
                send_buf(peer, data)?;
            }
        } else {
            let stream = self
                .peers
                .first_mut()
                .ok_or_else(|| TrainError::Distributed("process group already destroyed".into()))?;
            send_buf(stream, data)?;
            let reduced = recv_buf(stream, data.len())?;
            data.copy_from_slice(&reduced);
        }
        Ok(())
    }

    fn broadcast(&mut self, data: &mut [f32]) -> Result<()> {
        if self.world_size <= 1 {
            return Ok(());
        }
        if self.rank == 0 {
            for peer in self.peers.iter_mut() {
                send_buf(peer, data)?;
            }
        } else {
            let stream = self
                .peers
                .first_mut()
                .ok_or_else(|| TrainError::Distributed("process group already destroyed".into()))?;
            let received = recv_buf(stream, data.len())?;
            data.copy_from_slice(&received);
        }
        Ok(())
    }

    fn barrier(&mut self) -> Result<()> {
        self.all_reduce_mean(&mut [])
    }

    fn destroy(&mut self) -> Result<()> {
        for peer in self.peers.drain(..) {
            // 相手が先に閉じていても問題ない
            let _ = peer.shutdown(std::net::Shutdown::Both);
        }
        Ok(())
    }
}

/// 計算デバイスを選ぶ。分散学習では `cuda:<rank>` に固定し、失敗は致命的。
fn select_device(kind: DeviceKind, rank: usize, distributed: bool) -> Result<Device> {
    let device = match kind {
        DeviceKind::Cpu => return Ok(Device::Cpu),
        DeviceKind::Cuda => Device::new_cuda(if distributed { rank } else { 0 }),
        DeviceKind::Metal => Device::new_metal(0),
    };
    match device {
        Ok(d) => Ok(d),
        Err(e) if distributed => Err(dist_err(&format!("bind {:?} device for rank {}", kind, rank), e)),
        Err(e) => {
            tracing::warn!(?kind, error = %e, "device not available, falling back to CPU");
            Ok(Device::Cpu)
        }
    }
}

/// プロセスの分散ID・デバイス・プロセスグループをまとめたもの
pub struct DistributedContext {
    rank: usize,
    world_size: usize,
    device: Device,
    group: Option<Box<dyn ProcessGroup>>,
}

impl DistributedContext {
    pub fn init(hp: &HParams) -> Result<Self> {
        if !hp.distributed_run {
            let device = select_device(hp.device, 0, false)?;
            tracing::info!(?device, "single-process training");
            return Ok(Self::single(device));
        }
        let (Some(rank), Some(world_size)) = (hp.rank, hp.world_size) else {
            return Err(TrainError::MissingDistributedIdentity);
        };
        let device = select_device(hp.device, rank, true)?;
        tracing::info!(rank, world_size, rendezvous = %hp.rendezvous, "initializing process group");
        let group = TcpProcessGroup::connect(&hp.rendezvous, rank, world_size)?;
        tracing::info!(rank, world_size, "process group ready");
        Ok(Self::with_group(Box::new(group), device))
    }

    pub fn single(device: Device) -> Self {
        Self {
            rank: 0,
            world_size: 1,
            device,
            group: None,
        }
    }

    pub fn with_group(group: Box<dyn ProcessGroup>, device: Device) -> Self {
        Self {
            rank: group.rank(),
            world_size: group.world_size(),
            device,
            group: Some(group),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// ログ・検証・チェックポイントを担当するランク
    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }

    /// 逆伝播し、`net` の勾配を全ランクで平均して返す
    pub fn backward<M>(&mut self, net: &Network<M>, loss: &Tensor) -> Result<GradMap> {
        let store = loss.backward()?;
        let mut grads = net.grads(&store)?;
        let Some(group) = self.group.as_mut() else {
            return Ok(grads);
        };
        if group.world_size() <= 1 {
            return Ok(grads);
        }

        // 勾配の無いパラメータも 0 として参加させ、全ランクで同じ長さにする
        let vars = net.named_vars()?;
        let mut flat = Vec::new();
        for (name, var) in &vars {
            let g = match grads.get(name) {
                Some(g) => g.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?,
                None => vec![0f32; var.elem_count()],
            };
            flat.extend(g);
        }
        group.all_reduce_mean(&mut flat)?;

        let mut offset = 0;
        for (name, var) in &vars {
            let n = var.elem_count();
            let g = Tensor::from_slice(&flat[offset..offset + n], var.dims(), &Device::Cpu)?
                .to_dtype(var.dtype())?
                .to_device(var.device())?;
            grads.insert(name.clone(), g);
            offset += n;
        }
        Ok(grads)
    }

    /// ランク 0 のパラメータを全ランクへ配り、初期値を揃える
    pub fn broadcast_parameters<M>(&mut self, net: &Network<M>) -> Result<()> {
        let Some(group) = self.group.as_mut() else {
            return Ok(());
        };
        if group.world_size() <= 1 {
            return Ok(());
        }
        for (_, var) in net.named_vars()? {
            let mut flat = var.as_tensor().to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            group.broadcast(&mut flat)?;
            let t = Tensor::from_slice(&flat, var.dims(), &Device::Cpu)?
                .to_dtype(var.dtype())?
                .to_device(var.device())?;
            var.set(&t)?;
        }
        tracing::debug!(rank = self.rank, role = %net.role(), "parameters synchronized");
        Ok(())
    }

    pub fn barrier(&mut self) -> Result<()> {
        match self.group.as_mut() {
            Some(g) => g.barrier(),
            None => Ok(()),
        }
    }

    /// プロセスグループを明示的に破棄する
    pub fn shutdown(mut self) -> Result<()> {
        if let Some(mut group) = self.group.take() {
            group.destroy()?;
            tracing::info!(rank = self.rank, "process group destroyed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::base_json;

    #[test]
    fn test_all_reduce_mean_over_tcp() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?.to_string();
        let world = 3;

        let mut handles = Vec::new();
        for rank in 1..world {
            let addr = addr.clone();
            handles.push(std::thread::spawn(move || -> Result<Vec<f32>> {
                let mut g = TcpProcessGroup::join(&addr, rank, world)?;
                let mut data = vec![rank as f32, 10.0 * rank as f32];
                g.all_reduce_mean(&mut data)?;
                let mut init = vec![-1.0; 3];
                g.broadcast(&mut init)?;
                assert_eq!(init, vec![7.0, 8.0, 9.0]);
                g.barrier()?;
                g.destroy()?;
                Ok(data)
            }));
        }
        let mut g = TcpProcessGroup::host(listener, world)?;
        let mut data = vec![0.0, 0.0];
        g.all_reduce_mean(&mut data)?;
        g.broadcast(&mut [7.0, 8.0, 9.0])?;
        g.barrier()?;
        g.destroy()?;

        assert_eq!(data, vec![1.0, 10.0]);
        for h in handles {
            let r = h.join().map_err(|_| TrainError::Distributed("thread panicked".into()))??;
            assert_eq!(r, vec![1.0, 10.0]);
        }
        Ok(())
    }

    #[test]
    fn test_size_mismatch_is_error() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?.to_string();
        let h = std::thread::spawn(move || -> Result<()> {
            let mut g = TcpProcessGroup::join(&addr, 1, 2)?;
            let _ = g.all_reduce_mean(&mut [1.0, 2.0, 3.0]);
            Ok(())
        });
        let mut g = TcpProcessGroup::host(listener, 2)?;
        assert!(matches!(
            g.all_reduce_mean(&mut [1.0]),
            Err(TrainError::Distributed(_))
        ));
        g.destroy()?;
        let _ = h.join();
        Ok(())
    }

    #[test]
    fn test_distributed_requires_identity() -> Result<()> {
        let mut v = base_json();
        v["distributed_run"] = serde_json::json!(true);
        let hp = HParams::from_json_str(&v.to_string())?;
        assert!(matches!(
            DistributedContext::init(&hp),
            Err(TrainError::MissingDistributedIdentity)
        ));
        Ok(())
    }

    #[test]
    fn test_single_process_context() -> Result<()> {
        let hp = HParams::from_json_str(&base_json().to_string())?;
        let ctx = DistributedContext::init(&hp)?;
        assert!(ctx.is_primary());
        assert_eq!((ctx.rank(), ctx.world_size()), (0, 1));
        assert!(ctx.device().is_cpu());
        ctx.shutdown()
    }
}
