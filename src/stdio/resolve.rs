//! Stdio resolver: turns raw per-fd options into immutable [`FdSpec`]s.
//!
//! All failures here are configuration errors, reported before any
//! process is spawned.

use super::{Direction, FdSpec, StdioItem, STDERR_FD, STDIN_FD, STDOUT_FD};
use crate::command::{ProcessCommand, StdioSpec};
use crate::error::ExecError;
use crate::transform::Stage;

pub(crate) fn resolve_stdio(command: &mut ProcessCommand) -> Result<Vec<FdSpec>, ExecError> {
    let mut specs = Vec::with_capacity(3 + command.extra_fds.len());

    let mut stdin_items = normalize(std::mem::replace(
        &mut command.stdin,
        StdioSpec::Default,
    ))?;
    apply_input_shortcuts(command, &mut stdin_items)?;
    specs.push(build_spec(STDIN_FD, stdin_items)?);

    let stdout_items = normalize(std::mem::replace(
        &mut command.stdout,
        StdioSpec::Default,
    ))?;
    specs.push(build_spec(STDOUT_FD, stdout_items)?);

    let stderr_items = normalize(std::mem::replace(
        &mut command.stderr,
        StdioSpec::Default,
    ))?;
    specs.push(build_spec(STDERR_FD, stderr_items)?);

    let extra = std::mem::take(&mut command.extra_fds);
    for (fd, spec) in extra {
        if fd <= STDERR_FD {
            return Err(ExecError::Config(format!(
                "fd {fd} must be configured through its stdin/stdout/stderr option"
            )));
        }
        let items = normalize(spec)?;
        specs.push(build_spec(fd, items)?);
    }
    specs.sort_by_key(|spec| spec.fd);

    for spec in &specs {
        if spec.fd > STDERR_FD && !matches!(spec.items.as_slice(), [StdioItem::Ipc]) {
            return Err(ExecError::Config(format!(
                "fd {}: extra file descriptors only support the ipc item",
                spec.fd
            )));
        }
    }
    Ok(specs)
}

/// The `input`/`input_file` shortcuts become stdin items.
fn apply_input_shortcuts(
    command: &mut ProcessCommand,
    items: &mut Vec<StdioItem>,
) -> Result<(), ExecError> {
    if command.input.is_some() && command.input_file.is_some() {
        return Err(ExecError::Config(
            "the input and input_file options are mutually exclusive".to_string(),
        ));
    }
    if let Some(data) = command.input.take() {
        items.push(StdioItem::Literal(data));
    }
    if let Some(path) = command.input_file.take() {
        items.push(StdioItem::File(path));
    }
    Ok(())
}

fn normalize(spec: StdioSpec) -> Result<Vec<StdioItem>, ExecError> {
    match spec {
        StdioSpec::Default => Ok(vec![StdioItem::Pipe]),
        StdioSpec::Single(item) => Ok(vec![item]),
        StdioSpec::List(items) => {
            if items.is_empty() {
                Err(ExecError::Config(
                    "stdio item list must not be empty".to_string(),
                ))
            } else {
                Ok(items)
            }
        }
    }
}

fn build_spec(fd: u32, mut items: Vec<StdioItem>) -> Result<FdSpec, ExecError> {
    validate_exclusive(fd, &items)?;
    share_duplicate_files(&mut items);
    let direction = infer_direction(fd, &items)?;
    validate_direction(fd, direction, &items)?;
    let object_mode = object_mode_of(direction, &items);
    Ok(FdSpec {
        fd,
        direction,
        items,
        object_mode,
    })
}

fn validate_exclusive(fd: u32, items: &[StdioItem]) -> Result<(), ExecError> {
    if items.len() > 1 {
        if let Some(exclusive) = items.iter().find(|item| item.is_exclusive()) {
            return Err(ExecError::Config(format!(
                "fd {fd}: `{}` cannot be combined with other stdio items",
                exclusive.kind()
            )));
        }
    }
    Ok(())
}

/// Two items on one fd naming the same file share one underlying
/// resource instead of opening it twice.
fn share_duplicate_files(items: &mut Vec<StdioItem>) {
    let mut seen = Vec::new();
    items.retain(|item| match item {
        StdioItem::File(path) => {
            if seen.contains(path) {
                false
            } else {
                seen.push(path.clone());
                true
            }
        }
        _ => true,
    });
}

fn infer_direction(fd: u32, items: &[StdioItem]) -> Result<Direction, ExecError> {
    match fd {
        STDIN_FD => return Ok(Direction::Input),
        STDOUT_FD | STDERR_FD => return Ok(Direction::Output),
        _ => {}
    }

    let mut input_evidence = false;
    let mut output_evidence = false;
    for item in items {
        match item {
            StdioItem::Reader(_) | StdioItem::Literal(_) => input_evidence = true,
            StdioItem::Writer(_) | StdioItem::Ipc => output_evidence = true,
            // Files, pipes, stages and inherit are ambiguous on their own.
            _ => {}
        }
    }
    match (input_evidence, output_evidence) {
        (true, true) => Err(ExecError::Config(format!(
            "fd {fd}: stdio items disagree on direction"
        ))),
        (true, false) => Ok(Direction::Input),
        // Ambiguous extra fds default to output.
        _ => Ok(Direction::Output),
    }
}

fn validate_direction(fd: u32, direction: Direction, items: &[StdioItem]) -> Result<(), ExecError> {
    for item in items {
        let conflict = match direction {
            Direction::Input => matches!(item, StdioItem::Writer(_)),
            Direction::Output => matches!(item, StdioItem::Reader(_) | StdioItem::Literal(_)),
        };
        if conflict {
            return Err(ExecError::Config(format!(
                "fd {fd}: `{}` item is not valid on an {} fd",
                item.kind(),
                match direction {
                    Direction::Input => "input",
                    Direction::Output => "output",
                }
            )));
        }
    }
    Ok(())
}

fn object_mode_of(direction: Direction, items: &[StdioItem]) -> bool {
    let stages = items.iter().filter_map(|item| match item {
        StdioItem::Stage(stage) => Some(stage),
        _ => None,
    });
    match direction {
        Direction::Output => stages
            .last()
            .map(Stage::readable_object_mode)
            .unwrap_or(false),
        Direction::Input => {
            let mut stages = stages;
            stages
                .next()
                .map(Stage::writable_object_mode)
                .unwrap_or(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ProcessCommandBuilder;
    use std::path::PathBuf;

    fn resolve(command: &mut ProcessCommand) -> Result<Vec<FdSpec>, ExecError> {
        resolve_stdio(command)
    }

    #[test]
    fn defaults_resolve_to_pipes() {
        let mut command = ProcessCommandBuilder::new("true").build();
        let specs = resolve(&mut command).unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].direction, Direction::Input);
        assert_eq!(specs[1].direction, Direction::Output);
        assert_eq!(specs[2].direction, Direction::Output);
        assert!(matches!(specs[0].items.as_slice(), [StdioItem::Pipe]));
    }

    #[test]
    fn input_shortcut_becomes_stdin_literal() {
        let mut command = ProcessCommandBuilder::new("cat").input("hello").build();
        let specs = resolve(&mut command).unwrap();
        assert!(specs[0].has(|item| matches!(item, StdioItem::Literal(data) if data == b"hello")));
    }

    #[test]
    fn input_and_input_file_conflict() {
        let mut command = ProcessCommandBuilder::new("cat")
            .input("x")
            .input_file("/tmp/f")
            .build();
        assert!(matches!(
            resolve(&mut command).unwrap_err(),
            ExecError::Config(_)
        ));
    }

    #[test]
    fn empty_item_list_rejected() {
        let mut command = ProcessCommandBuilder::new("true")
            .stdout_items(Vec::new())
            .build();
        assert!(matches!(
            resolve(&mut command).unwrap_err(),
            ExecError::Config(_)
        ));
    }

    #[test]
    fn ignore_cannot_mix_with_other_items() {
        let mut command = ProcessCommandBuilder::new("true")
            .stdout_items(vec![StdioItem::Ignore, StdioItem::Pipe])
            .build();
        let err = resolve(&mut command).unwrap_err();
        assert!(err.to_string().contains("ignore"));
    }

    #[test]
    fn duplicate_file_targets_are_shared() {
        let path = PathBuf::from("/tmp/shared.log");
        let mut command = ProcessCommandBuilder::new("true")
            .stdout_items(vec![
                StdioItem::Pipe,
                StdioItem::File(path.clone()),
                StdioItem::File(path.clone()),
            ])
            .build();
        let specs = resolve(&mut command).unwrap();
        let file_count = specs[1]
            .items
            .iter()
            .filter(|item| matches!(item, StdioItem::File(_)))
            .count();
        assert_eq!(file_count, 1);
    }

    #[test]
    fn extra_fd_direction_inferred_from_literal() {
        let items = vec![StdioItem::Literal(b"x".to_vec())];
        assert_eq!(infer_direction(3, &items).unwrap(), Direction::Input);
    }

    #[test]
    fn extra_fd_defaults_to_output() {
        let items = vec![StdioItem::File(PathBuf::from("/tmp/out"))];
        assert_eq!(infer_direction(3, &items).unwrap(), Direction::Output);
    }

    #[test]
    fn conflicting_extra_fd_direction_rejected() {
        let items = vec![StdioItem::Literal(b"x".to_vec()), StdioItem::Ipc];
        assert!(infer_direction(3, &items).is_err());
    }

    #[test]
    fn extra_fd_only_supports_ipc() {
        let mut command = ProcessCommandBuilder::new("true")
            .fd(3, StdioSpec::Single(StdioItem::File("/tmp/x".into())))
            .build();
        let err = resolve(&mut command).unwrap_err();
        assert!(err.to_string().contains("ipc"));
    }

    #[test]
    fn literal_on_stdout_rejected() {
        let mut command = ProcessCommandBuilder::new("true")
            .stdout(StdioItem::Literal(b"x".to_vec()))
            .build();
        assert!(matches!(
            resolve(&mut command).unwrap_err(),
            ExecError::Config(_)
        ));
    }
}
