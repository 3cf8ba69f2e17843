use crate::error::{Result, TrainError};
use crate::optim::GradMap;
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::MutexGuard;

/// 敵対的学習における役割
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetRole {
    Generator,
    Discriminator,
}

impl NetRole {
    /// チェックポイント名に使う短いタグ
    pub fn tag(self) -> &'static str {
        match self {
            NetRole::Generator => "G",
            NetRole::Discriminator => "D",
        }
    }
}

impl std::fmt::Display for NetRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetRole::Generator => write!(f, "generator"),
            NetRole::Discriminator => write!(f, "discriminator"),
        }
    }
}

/// モジュールとその学習可能パラメータ (VarMap) の組
pub struct Network<M> {
    pub module: M,
    varmap: VarMap,
    role: NetRole,
    config: serde_json::Value,
}

impl<M> Network<M> {
    /// `ctor` に VarBuilder を渡してモジュールを構築する
    pub fn build<C, F>(role: NetRole, config: &C, device: &Device, ctor: F) -> Result<Self>
    where
        C: Serialize,
        F: FnOnce(&C, VarBuilder) -> anyhow::Result<M>,
    {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let module = ctor(config, vs)?;
        let config = serde_json::to_value(config)?;
        Ok(Self {
            module,
            varmap,
            role,
            config,
        })
    }

    pub fn role(&self) -> NetRole {
        self.role
    }

    /// 構築に使った設定 (チェックポイントにモデル記述として保存する)
    pub fn config_json(&self) -> &serde_json::Value {
        &self.config
    }

    fn vars(&self) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
        self.varmap
            .data()
            .lock()
            .map_err(|_| TrainError::StateMismatch(format!("{} parameter map lock poisoned", self.role)))
    }

    /// 名前順に並べたパラメータ
    pub fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let vars = self.vars()?;
        let mut named: Vec<(String, Var)> = vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(named)
    }

    pub fn num_parameters(&self) -> Result<usize> {
        Ok(self.vars()?.values().map(|v| v.elem_count()).sum())
    }

    /// 逆伝播結果からこのネットワークのパラメータの勾配だけを取り出す
    pub fn grads(&self, store: &GradStore) -> Result<GradMap> {
        let vars = self.vars()?;
        let mut grads = GradMap::new();
        for (name, var) in vars.iter() {
            if let Some(g) = store.get(var.as_tensor()) {
                grads.insert(name.clone(), g.clone());
            }
        }
        Ok(grads)
    }

    /// 現在値のコピー。以後の `Var::set` の影響を受けない。
    pub fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let vars = self.vars()?;
        let mut state = HashMap::with_capacity(vars.len());
        for (k, v) in vars.iter() {
            state.insert(k.clone(), v.as_tensor().detach().copy()?);
        }
        Ok(state)
    }

    /// 名前と形状が 1 対 1 で一致する場合のみ読み込む
    pub fn load_state_dict(&self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let vars = self.vars()?;
        if let Some(extra) = tensors.keys().find(|k| !vars.contains_key(*k)) {
            return Err(TrainError::StateMismatch(format!(
                "{}: unexpected parameter `{}` in state",
                self.role, extra
            )));
        }
        for (name, var) in vars.iter() {
            let t = tensors.get(name).ok_or_else(|| {
                TrainError::StateMismatch(format!("{}: parameter `{}` missing from state", self.role, name))
            })?;
            if t.dims() != var.dims() {
                return Err(TrainError::StateMismatch(format!(
                    "{}: parameter `{}` has shape {:?}, expected {:?}",
                    self.role,
                    name,
                    t.dims(),
                    var.dims()
                )));
            }
        }
        for (name, var) in vars.iter() {
            if let Some(t) = tensors.get(name) {
                var.set(&t.to_device(var.device())?.to_dtype(var.dtype())?)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Affine {
        w: Tensor,
    }

    fn build(dim: usize) -> Result<Network<Affine>> {
        Network::build(NetRole::Generator, &dim, &Device::Cpu, |dim, vs| {
            let w = vs.get_with_hints((*dim, 2), "w", candle_nn::Init::Const(0.5))?;
            Ok(Affine { w })
        })
    }

    #[test]
    fn test_state_dict_roundtrip() -> Result<()> {
        let a = build(3)?;
        let b = build(3)?;
        let mut state = a.state_dict()?;
        state.insert("w".to_string(), Tensor::ones((3, 2), DType::F32, &Device::Cpu)?);
        b.load_state_dict(&state)?;
        let w = b.module.w.to_vec2::<f32>()?;
        assert_eq!(w, vec![vec![1.0; 2]; 3]);
        assert_eq!(b.num_parameters()?, 6);
        assert_eq!(b.config_json(), &serde_json::json!(3));
        Ok(())
    }

    #[test]
    fn test_state_dict_is_a_snapshot() -> Result<()> {
        let a = build(2)?;
        let snapshot = a.state_dict()?;
        for (_, var) in a.named_vars()? {
            var.set(&var.ones_like()?)?;
        }
        assert_eq!(snapshot["w"].to_vec2::<f32>()?, vec![vec![0.5; 2]; 2]);
        assert_eq!(a.module.w.to_vec2::<f32>()?, vec![vec![1.0; 2]; 2]);
        Ok(())
    }

    #[test]
    fn test_load_rejects_mismatch() -> Result<()> {
        let a = build(3)?;
        let other = build(4)?;
        assert!(matches!(
            a.load_state_dict(&other.state_dict()?),
            Err(TrainError::StateMismatch(_))
        ));
        let mut extra = a.state_dict()?;
        extra.insert("bogus".into(), Tensor::zeros(1, DType::F32, &Device::Cpu)?);
        assert!(a.load_state_dict(&extra).is_err());
        assert!(a.load_state_dict(&HashMap::new()).is_err());
        Ok(())
    }

    #[test]
    fn test_grads_only_cover_own_parameters() -> Result<()> {
        let a = build(2)?;
        let b = build(2)?;
        let loss = (a.module.w.sum_all()? * 2.0)?;
        let store = loss.backward()?;
        assert_eq!(a.grads(&store)?.len(), 1);
        assert!(b.grads(&store)?.is_empty());
        Ok(())
    }
}
