//! 学習制御: 早期終了と学習率減衰（ReduceLROnPlateau）
//!
//! どちらもエポック終了時の検証指標だけを入力とする状態機械です。
//! フェーズごとに新しく作り直します。

/// 指標の改善方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateauMode {
    /// 小さいほど良い（損失）
    Min,
    /// 大きいほど良い（精度）
    Max,
}

impl PlateauMode {
    fn initial(self) -> f64 {
        match self {
            PlateauMode::Min => f64::INFINITY,
            PlateauMode::Max => f64::NEG_INFINITY,
        }
    }

    fn improved(self, metric: f64, best: f64, min_delta: f64) -> bool {
        match self {
            PlateauMode::Min => metric < best - min_delta,
            PlateauMode::Max => metric > best + min_delta,
        }
    }
}

/// 早期終了の判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoppingDecision {
    /// 最良値を更新した（この時点の重みを保持する）
    Improved,
    /// 改善なし、継続
    Continue,
    /// 忍耐回数に達した（最良の重みに戻して終了）
    Stop,
}

/// 早期終了（val_accuracy を監視）
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    mode: PlateauMode,
    patience: usize,
    best: f64,
    best_epoch: Option<usize>,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, mode: PlateauMode) -> Self {
        Self {
            mode,
            patience,
            best: mode.initial(),
            best_epoch: None,
            wait: 0,
        }
    }

    /// エポック終了時に指標を渡して判定
    pub fn step(&mut self, epoch: usize, metric: f64) -> StoppingDecision {
        if self.mode.improved(metric, self.best, 0.0) {
            self.best = metric;
            self.best_epoch = Some(epoch);
            self.wait = 0;
            return StoppingDecision::Improved;
        }

        self.wait += 1;
        if self.wait >= self.patience {
            StoppingDecision::Stop
        } else {
            StoppingDecision::Continue
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}

/// 学習率減衰（val_loss を監視）
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    mode: PlateauMode,
    patience: usize,
    factor: f64,
    min_lr: f64,
    min_delta: f64,
    best: f64,
    wait: usize,
    current_lr: f64,
}

impl ReduceLrOnPlateau {
    pub fn new(initial_lr: f64, factor: f64, patience: usize, min_lr: f64, mode: PlateauMode) -> Self {
        Self {
            mode,
            patience,
            factor,
            min_lr,
            min_delta: 0.0,
            best: mode.initial(),
            wait: 0,
            current_lr: initial_lr,
        }
    }

    /// 改善とみなす最小変化量
    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta;
        self
    }

    /// 指標を渡して更新し、次のエポックの学習率を返す
    pub fn step(&mut self, metric: f64) -> f64 {
        if self.mode.improved(metric, self.best, self.min_delta) {
            self.best = metric;
            self.wait = 0;
            return self.current_lr;
        }

        self.wait += 1;
        if self.wait >= self.patience && self.current_lr > self.min_lr {
            self.current_lr = (self.current_lr * self.factor).max(self.min_lr);
            self.wait = 0;
        }
        self.current_lr
    }

    pub fn current_lr(&self) -> f64 {
        self.current_lr
    }
}
