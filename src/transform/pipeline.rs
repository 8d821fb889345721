//! Pipeline composer: chains transform stages per fd spec.
//!
//! Stage order for an output fd is `[encoding?, line split?, ...user,
//! validation, newline restore?]`; input fds run user stages reversed,
//! since input composition is "last stage writes to the process" while
//! output composition is "first stage reads from the process".
//!
//! Two drivers exist and are behaviorally identical for identical input:
//! the asynchronous driver runs each stage as a task pushing into a
//! bounded channel consumed by the next stage; the synchronous driver
//! requires every stage to be non-suspending and feeds chunks level by
//! level. In both, a stage's finish output is re-run through all
//! subsequent stages before being emitted.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::encoding::{Encoding, EncodingStage};
use super::lines::{LineSplitStage, NewlineRestoreStage};
use super::stage::{Chunk, Stage};
use super::validate::OutputValidationStage;
use crate::error::ExecError;
use crate::stdio::Direction;

const STAGE_CHANNEL_CAPACITY: usize = 16;

pub(crate) struct ComposeOptions {
    pub fd: u32,
    pub direction: Direction,
    pub encoding: Encoding,
    pub lines: bool,
    pub object_mode: bool,
    pub user_stages: Vec<Stage>,
}

pub struct Pipeline {
    stages: Vec<Stage>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages)
            .finish()
    }
}

pub(crate) struct PipelineOutput {
    pub rx: mpsc::Receiver<Result<Chunk, ExecError>>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub(crate) fn compose(opts: ComposeOptions) -> Result<Pipeline, ExecError> {
        let ComposeOptions {
            fd,
            direction,
            encoding,
            lines,
            object_mode,
            user_stages,
        } = opts;

        let has_user = !user_stages.is_empty();
        // Conversion is meaningless when the first consumer of the raw
        // stream already expects objects.
        let raw_consumer_object_mode = user_stages
            .first()
            .map(Stage::writable_object_mode)
            .unwrap_or(object_mode);
        let mut stages: Vec<Stage> = Vec::new();
        match direction {
            Direction::Output => {
                if !raw_consumer_object_mode {
                    stages.push(Stage::sync(EncodingStage::new(encoding)));
                    if lines || has_user {
                        stages.push(Stage::sync(LineSplitStage::new(false)));
                    }
                }
                stages.extend(user_stages);
                stages.push(Stage::sync(OutputValidationStage::new(object_mode)));
                if has_user && !lines && !object_mode {
                    stages.push(Stage::sync(NewlineRestoreStage));
                }
            }
            Direction::Input => {
                let mut user = user_stages;
                user.reverse();
                stages.extend(user);
                stages.push(Stage::sync(OutputValidationStage::new(object_mode)));
            }
        }

        validate_object_modes(&stages, fd)?;
        Ok(Pipeline { stages })
    }

    /// The synchronous mode only accepts non-suspending stages.
    pub(crate) fn ensure_sync(&self) -> Result<(), ExecError> {
        if self.stages.iter().all(Stage::is_sync) {
            Ok(())
        } else {
            Err(ExecError::Config(
                "synchronous mode requires non-suspending transform stages".to_string(),
            ))
        }
    }

    /// Run the whole pipeline over already-complete input.
    pub(crate) fn run_sync(mut self, input: Vec<Chunk>) -> Result<Vec<Chunk>, ExecError> {
        self.ensure_sync()?;
        let mut out = Vec::new();
        for chunk in input {
            out.extend(pass_sync(&mut self.stages, 0, chunk)?);
        }
        for i in 0..self.stages.len() {
            let flushed = self.stages[i].finish_sync()?;
            for chunk in flushed {
                out.extend(pass_sync(&mut self.stages, i + 1, chunk)?);
            }
        }
        Ok(out)
    }

    /// Spawn one task per stage, wired with bounded channels. Closing the
    /// input channel cascades each stage's finish downstream.
    pub(crate) fn spawn(self, input: mpsc::Receiver<Result<Chunk, ExecError>>) -> PipelineOutput {
        let mut rx = input;
        let mut tasks = Vec::with_capacity(self.stages.len());
        for stage in self.stages {
            let (tx, next_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
            tasks.push(spawn_stage(stage, rx, tx));
            rx = next_rx;
        }
        PipelineOutput { rx, tasks }
    }
}

fn spawn_stage(
    mut stage: Stage,
    mut rx: mpsc::Receiver<Result<Chunk, ExecError>>,
    tx: mpsc::Sender<Result<Chunk, ExecError>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            match stage.transform(chunk).await {
                Ok(outputs) => {
                    for output in outputs {
                        if tx.send(Ok(output)).await.is_err() {
                            // Downstream stopped consuming; stop producing.
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
        match stage.finish().await {
            Ok(outputs) => {
                for output in outputs {
                    if tx.send(Ok(output)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
            }
        }
    })
}

fn pass_sync(stages: &mut [Stage], start: usize, chunk: Chunk) -> Result<Vec<Chunk>, ExecError> {
    let mut current = vec![chunk];
    for stage in stages.iter_mut().skip(start) {
        let mut next = Vec::new();
        for c in current {
            next.extend(stage.transform_sync(c)?);
        }
        if next.is_empty() {
            return Ok(next);
        }
        current = next;
    }
    Ok(current)
}

/// `writable_object_mode` of stage *n* must equal `readable_object_mode`
/// of stage *n-1* (the raw stream is byte mode). Checked at composition
/// time, never at runtime.
fn validate_object_modes(stages: &[Stage], fd: u32) -> Result<(), ExecError> {
    let mut previous_readable = false;
    for (index, stage) in stages.iter().enumerate() {
        if stage.writable_object_mode() != previous_readable {
            return Err(ExecError::Config(format!(
                "fd {fd}: transform stage {index} expects {} input but the previous stage emits {}",
                mode_name(stage.writable_object_mode()),
                mode_name(previous_readable),
            )));
        }
        previous_readable = stage.readable_object_mode();
    }
    Ok(())
}

fn mode_name(object_mode: bool) -> &'static str {
    if object_mode {
        "object-mode"
    } else {
        "byte-mode"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::stage::Transform;
    use serde_json::json;

    fn output_options(user_stages: Vec<Stage>, lines: bool, object_mode: bool) -> ComposeOptions {
        ComposeOptions {
            fd: 1,
            direction: Direction::Output,
            encoding: Encoding::Utf8,
            lines,
            object_mode,
            user_stages,
        }
    }

    struct JsonParse;

    impl Transform for JsonParse {
        fn transform(&mut self, chunk: Chunk) -> Result<Vec<Chunk>, ExecError> {
            match chunk {
                Chunk::Text(s) if !s.trim().is_empty() => {
                    Ok(vec![Chunk::Value(serde_json::from_str(&s)?)])
                }
                _ => Ok(Vec::new()),
            }
        }
        fn readable_object_mode(&self) -> bool {
            true
        }
    }

    struct SuffixOnFinish;

    impl Transform for SuffixOnFinish {
        fn transform(&mut self, chunk: Chunk) -> Result<Vec<Chunk>, ExecError> {
            Ok(vec![chunk])
        }
        fn finish(&mut self) -> Result<Vec<Chunk>, ExecError> {
            Ok(vec![Chunk::Text("flushed".to_string())])
        }
    }

    struct Upper;

    impl Transform for Upper {
        fn transform(&mut self, chunk: Chunk) -> Result<Vec<Chunk>, ExecError> {
            match chunk {
                Chunk::Text(s) => Ok(vec![Chunk::Text(s.to_uppercase())]),
                other => Ok(vec![other]),
            }
        }
    }

    fn texts(chunks: Vec<Chunk>) -> Vec<String> {
        chunks
            .into_iter()
            .filter_map(|c| match c {
                Chunk::Text(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn sync_line_mode_splits_output() {
        let pipeline = Pipeline::compose(output_options(Vec::new(), true, false)).unwrap();
        let out = pipeline
            .run_sync(vec![Chunk::Bytes(b"a\nb\r\nc".to_vec())])
            .unwrap();
        assert_eq!(texts(out), vec!["a", "b", "c"]);
    }

    #[test]
    fn finish_output_runs_through_subsequent_stages() {
        let opts = output_options(
            vec![Stage::sync(SuffixOnFinish), Stage::sync(Upper)],
            true,
            false,
        );
        let pipeline = Pipeline::compose(opts).unwrap();
        let out = pipeline
            .run_sync(vec![Chunk::Bytes(b"one\n".to_vec())])
            .unwrap();
        // SuffixOnFinish's flush is uppercased by the later stage.
        assert_eq!(texts(out), vec!["ONE", "FLUSHED"]);
    }

    #[test]
    fn object_mode_pipeline_parses_json_lines() {
        let opts = output_options(vec![Stage::sync(JsonParse)], false, true);
        let pipeline = Pipeline::compose(opts).unwrap();
        let out = pipeline
            .run_sync(vec![Chunk::Bytes(b"{\"n\":1}\n{\"n\":2}\n".to_vec())])
            .unwrap();
        assert_eq!(
            out,
            vec![
                Chunk::Value(json!({"n": 1})),
                Chunk::Value(json!({"n": 2}))
            ]
        );
    }

    #[test]
    fn object_mode_without_stage_is_rejected_at_composition() {
        let err = Pipeline::compose(output_options(Vec::new(), false, true)).unwrap_err();
        assert!(matches!(err, ExecError::Config(_)));
    }

    #[tokio::test]
    async fn async_driver_matches_sync_driver() {
        let input_bytes: &[&[u8]] = &[b"al", b"pha\nbe", b"ta\ngam", b"ma"];

        let sync_out = {
            let pipeline =
                Pipeline::compose(output_options(vec![Stage::sync(Upper)], true, false)).unwrap();
            let chunks = input_bytes
                .iter()
                .map(|b| Chunk::Bytes(b.to_vec()))
                .collect();
            texts(pipeline.run_sync(chunks).unwrap())
        };

        let async_out = {
            let pipeline =
                Pipeline::compose(output_options(vec![Stage::sync(Upper)], true, false)).unwrap();
            let (tx, rx) = mpsc::channel(4);
            let mut output = pipeline.spawn(rx);
            for b in input_bytes {
                tx.send(Ok(Chunk::Bytes(b.to_vec()))).await.unwrap();
            }
            drop(tx);
            let mut collected = Vec::new();
            while let Some(item) = output.rx.recv().await {
                collected.push(item.unwrap());
            }
            for task in output.tasks {
                task.await.unwrap();
            }
            texts(collected)
        };

        assert_eq!(sync_out, async_out);
        assert_eq!(sync_out, vec!["ALPHA", "BETA", "GAMMA"]);
    }

    #[tokio::test]
    async fn async_driver_propagates_stage_errors() {
        let opts = output_options(vec![Stage::sync(JsonParse)], false, true);
        let pipeline = Pipeline::compose(opts).unwrap();
        let (tx, rx) = mpsc::channel(4);
        let mut output = pipeline.spawn(rx);
        tx.send(Ok(Chunk::Bytes(b"not json\n".to_vec())))
            .await
            .unwrap();
        drop(tx);
        let mut saw_error = false;
        while let Some(item) = output.rx.recv().await {
            if item.is_err() {
                saw_error = true;
            }
        }
        assert!(saw_error);
        for task in output.tasks {
            task.await.unwrap();
        }
    }
}
