use tracing::debug;

use super::BusError;
use super::Connection;
use crate::dali::Command;
use crate::dali::Instruction;
use crate::dali::Progress;
use crate::dali::Reply;
use crate::dali::Sequence;
use crate::dali::sequence::Single;

/// Callback for progress reports raised by a sequence.
pub type ProgressFn<'a> = &'a mut (dyn FnMut(&Progress) + Send);

/// Run a sequence to completion over an open connection.
///
/// Sleeps block this transaction (and with it the whole bridge); nothing
/// else is scheduled during a device's turn.
pub async fn execute<S>(
    conn: &mut dyn Connection,
    mut sequence: S,
    mut progress: Option<ProgressFn<'_>>,
) -> Result<S::Output, BusError>
where
    S: Sequence + Send,
{
    let mut reply = None;
    loop {
        match sequence.step(reply.take())? {
            Instruction::Send(command) => {
                let response = conn.exchange(&command).await?;
                debug!("{} -> {:?}", command, response);
                reply = Some(response);
            }
            Instruction::Sleep(delay) => {
                debug!("sequence sleeping for {:?}", delay);
                tokio::time::sleep(delay).await;
            }
            Instruction::Progress(report) => {
                if let Some(callback) = progress.as_mut() {
                    callback(&report);
                }
            }
            Instruction::Done(output) => return Ok(output),
        }
    }
}

/// Send a single command.
pub async fn send(conn: &mut dyn Connection, command: Command) -> Result<Reply, BusError> {
    execute(conn, Single::new(command), None).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::dali::Address;
    use crate::dali::SequenceError;
    use crate::dali::sequence::QueryDeviceTypes;

    /// Answers from a script and records what was sent.
    #[derive(Default)]
    struct Scripted {
        replies: Vec<Reply>,
        sent: Vec<Command>,
    }

    #[async_trait]
    impl Connection for Scripted {
        async fn exchange(&mut self, command: &Command) -> Result<Reply, BusError> {
            self.sent.push(command.clone());
            if self.replies.is_empty() {
                return Ok(Reply::NoAnswer);
            }
            Ok(self.replies.remove(0))
        }
    }

    /// Sleeps, reports, sends once, then returns the reply doubled.
    struct SleepThenQuery {
        step: u8,
    }

    impl Sequence for SleepThenQuery {
        type Output = u16;

        fn step(&mut self, reply: Option<Reply>) -> Result<Instruction<u16>, SequenceError> {
            self.step += 1;
            Ok(match self.step {
                1 => Instruction::Sleep(Duration::from_millis(500)),
                2 => Instruction::Progress(Progress::message("halfway")),
                3 => Instruction::Send(Command::query_actual_level(Address::Short(0))),
                _ => {
                    let value = reply
                        .and_then(Reply::value)
                        .ok_or(SequenceError::NoResponse("QueryActualLevel"))?;
                    Instruction::Done(u16::from(value) * 2)
                }
            })
        }
    }

    #[tokio::test]
    async fn test_send_is_single_step() {
        let mut conn = Scripted {
            replies: vec![Reply::Frame(100)],
            ..Default::default()
        };
        let reply = send(&mut conn, Command::query_actual_level(Address::Short(4)))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Frame(100));
        assert_eq!(conn.sent.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_and_progress() {
        let mut conn = Scripted {
            replies: vec![Reply::Frame(21)],
            ..Default::default()
        };
        let mut reports = Vec::new();
        let mut record = |p: &Progress| reports.push(p.message.clone());

        let start = Instant::now();
        let result = execute(&mut conn, SleepThenQuery { step: 0 }, Some(&mut record))
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert_eq!(reports, vec!["halfway".to_string()]);
    }

    #[tokio::test]
    async fn test_progress_without_callback() {
        let mut conn = Scripted {
            replies: vec![Reply::Frame(21)],
            ..Default::default()
        };
        let result = execute(&mut conn, SleepThenQuery { step: 0 }, None).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_sequence_error_surfaces() {
        let mut conn = Scripted::default();
        let result = execute(&mut conn, QueryDeviceTypes::new(Address::Short(9)), None).await;
        assert!(matches!(
            result,
            Err(BusError::Sequence(SequenceError::NoResponse("QueryDeviceType")))
        ));
    }
}
