use criterion::{Criterion, criterion_group, criterion_main};
use resilience::RetryOptions;
use saga::{
    InMemoryInstanceStore, OrchestratorConfig, SagaCommand, SagaContext, SagaDefinition,
    SagaOrchestrator, SagaStatus, SagaStep, StepOutcome, SystemClock,
};
use serde_json::json;

fn chain_definition(steps: usize) -> SagaDefinition {
    let mut definition = SagaDefinition::new("bench-chain", "Bench Chain");
    for index in 0..steps {
        let mut step = SagaStep::new(format!("step-{index}"), SagaCommand::new("noop", json!({})));
        if index > 0 {
            step = step.with_dependency(format!("step-{}", index - 1));
        }
        definition = definition.step(step);
    }
    definition
}

async fn run_to_status(
    engine: &SagaOrchestrator<bus::InMemoryBus, InMemoryInstanceStore, SystemClock>,
    saga_id: common::SagaId,
    status: SagaStatus,
) {
    loop {
        if let Some(instance) = engine.get_saga_instance(saga_id).await
            && instance.status == status
        {
            return;
        }
        tokio::task::yield_now().await;
    }
}

fn bench_validate_definition(c: &mut Criterion) {
    let definition = chain_definition(6);

    c.bench_function("saga/validate_definition", |b| {
        b.iter(|| definition.validate().unwrap());
    });
}

fn bench_start_and_complete(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga/start_and_complete", |b| {
        b.iter(|| {
            rt.block_on(async {
                let engine = SagaOrchestrator::in_memory(
                    OrchestratorConfig::default().with_default_retry(RetryOptions::no_retry()),
                );
                engine.register_saga(chain_definition(3)).await.unwrap();
                engine
                    .register_step_fn(
                        "noop",
                        |_command: SagaCommand, _context: SagaContext| async move {
                            StepOutcome::ok()
                        },
                    )
                    .await;

                let saga_id = engine.start_saga("bench-chain", json!({})).await.unwrap();
                run_to_status(&engine, saga_id, SagaStatus::Completed).await;
            });
        });
    });
}

fn bench_compensation_walk(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga/compensate_two_steps", |b| {
        b.iter(|| {
            rt.block_on(async {
                let engine = SagaOrchestrator::in_memory(
                    OrchestratorConfig::default().with_default_retry(RetryOptions::no_retry()),
                );
                let definition = SagaDefinition::new("bench-undo", "Bench Undo")
                    .step(
                        SagaStep::new("first", SagaCommand::new("apply", json!({})))
                            .with_compensation(SagaCommand::new("revert", json!({}))),
                    )
                    .step(
                        SagaStep::new("second", SagaCommand::new("explode", json!({})))
                            .with_dependency("first"),
                    );
                engine.register_saga(definition).await.unwrap();
                engine
                    .register_step_fn(
                        "apply",
                        |_command: SagaCommand, _context: SagaContext| async move {
                            StepOutcome::ok()
                        },
                    )
                    .await;
                engine
                    .register_step_fn(
                        "explode",
                        |_command: SagaCommand, _context: SagaContext| async move {
                            StepOutcome::fatal("boom")
                        },
                    )
                    .await;
                engine
                    .register_compensation_fn(
                        "revert",
                        |_command: SagaCommand, _context: SagaContext| async move {
                            StepOutcome::ok()
                        },
                    )
                    .await;

                let saga_id = engine.start_saga("bench-undo", json!({})).await.unwrap();
                run_to_status(&engine, saga_id, SagaStatus::Compensated).await;
            });
        });
    });
}

criterion_group!(
    benches,
    bench_validate_definition,
    bench_start_and_complete,
    bench_compensation_walk
);
criterion_main!(benches);
