//! Ferry CLI: inspect Arrow IPC files and exercise the sink conversion path.

use std::process::ExitCode;
use std::sync::Arc;

use arrow::array::{BooleanArray, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use clap::Parser;
use tracing::info;

use ferry::{
    CancelableTaskRunner, CliArgs, Command, ExchangeConfig, ExecutionMonitor, SinkWriter,
    TableConverter, cancel_on_shutdown, init_tracing, inspect_file,
};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = CliArgs::parse();

    let config = match args.load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    let monitor = ExecutionMonitor::new();
    let _signal = cancel_on_shutdown(monitor.token().clone());

    let result = match args.command {
        Command::Inspect { file } => {
            info!("Inspecting {}", file.display());
            let runner = CancelableTaskRunner::with_poll_interval(config.cancel_poll_interval());
            runner
                .run_one(inspect_file(file, config), &monitor)
                .await
                .and_then(|report| to_json(&report))
        }
        Command::Demo { batches, rows } => run_demo(config, batches, rows, &monitor).await,
    };

    match result {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Ferry failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_demo(
    config: ExchangeConfig,
    batches: usize,
    rows: usize,
    monitor: &ExecutionMonitor,
) -> ferry::Result<String> {
    info!("Writing {batches} batch(es) of {rows} row(s) through a sink");

    let converter = TableConverter::new(config)?;
    let result = async {
        let sink = converter.create_sink()?;
        let schema = demo_schema();
        let mut writer = SinkWriter::try_new(Arc::clone(&sink), Arc::clone(&schema))?;
        for index in 0..batches {
            writer.write(&demo_batch(&schema, index, rows)?)?;
        }
        writer.finish()?;

        let table = converter.convert_to_table(&sink, monitor).await?;
        to_json(&serde_json::json!({
            "path": table.path(),
            "rows": table.row_count(),
            "summary": table.domain_and_metadata(),
        }))
    }
    .await;

    converter.close().await;
    result
}

fn demo_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("key", DataType::Utf8, false),
        Field::new("value", DataType::Int64, false),
        Field::new("even", DataType::Boolean, false),
    ]))
}

fn demo_batch(schema: &SchemaRef, index: usize, rows: usize) -> ferry::Result<RecordBatch> {
    let start = (index * rows) as i64;
    let values: Vec<i64> = (start..start + rows as i64).collect();
    let keys: Vec<String> = values.iter().map(|v| format!("row-{v}")).collect();
    let even: Vec<bool> = values.iter().map(|v| v % 2 == 0).collect();

    let batch = RecordBatch::try_new(
        Arc::clone(schema),
        vec![
            Arc::new(StringArray::from(keys)),
            Arc::new(Int64Array::from(values)),
            Arc::new(BooleanArray::from(even)),
        ],
    )?;
    Ok(batch)
}

fn to_json<T: serde::Serialize>(value: &T) -> ferry::Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| ferry::ExchangeError::ContractViolation {
        message: format!("failed to render report: {e}"),
    })
}
