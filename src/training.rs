use crate::checkpoint::{CheckpointManager, RestoreTarget};
use crate::config::TrainConfig;
use crate::error::Result;
use crate::observer::TracingObserver;
use crate::pinn::{AdvectionSampler, BatchSizes, build_registry};
use crate::scheduler::{TrainingScheduler, TrainingSummary};
use burn::backend::{Autodiff, NdArray};
use burn::optim::AdamConfig;
use burn::prelude::Backend;
use std::path::Path;
use std::time::Instant;

type MyBackend = Autodiff<NdArray<f32>>;

/// 移流方程式の学習を実行します。
///
/// `resume` を指定した場合は `workdir/<run_name>` のチェックポイントから再開します。
pub fn run(
    config: &TrainConfig,
    workdir: &Path,
    resume: Option<RestoreTarget>,
) -> Result<TrainingSummary> {
    config.validate()?;
    let device = Default::default();
    MyBackend::seed(config.seed);

    // --- モデルとオプティマイザの初期化 ---
    let model = config.model.init::<MyBackend>(&device);
    let optim = AdamConfig::new()
        .with_beta_1(config.optim.beta1)
        .with_beta_2(config.optim.beta2)
        .with_epsilon(config.optim.eps)
        .init();

    let checkpoints =
        CheckpointManager::new(workdir, &config.run_name, config.saving.num_keep_ckpts)?;
    let mut scheduler = TrainingScheduler::new(
        config,
        model,
        optim,
        build_registry::<MyBackend>()?,
        checkpoints,
    )?;
    if let Some(target) = resume {
        scheduler = scheduler.restore(target, &device)?;
    }

    let mut sampler = AdvectionSampler::<MyBackend>::new(
        config.seed,
        BatchSizes::from_batch_size(config.training.batch_size),
        &device,
    );

    tracing::info!(
        "学習を開始します (移流方程式) - バックエンド: NdArray (CPU), step {} / {}",
        scheduler.step(),
        config.training.max_steps
    );
    let training_start = Instant::now();
    let summary = scheduler.run(&mut sampler, &mut TracingObserver)?;
    tracing::info!("学習が完了しました。");
    tracing::info!("=> 学習時間: {:.2?}", training_start.elapsed());
    if let Some(path) = &summary.last_checkpoint {
        tracing::info!("=> 最新のチェックポイント: {}", path.display());
    }
    Ok(summary)
}
