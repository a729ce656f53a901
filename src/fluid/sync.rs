//! Rendezvous handshake between a worker task and its consumer.
//!
//! A worker calls [`Producer::sync`] after each unit of work. The call blocks
//! until the consumer takes the output with [`Consumer::receive`] and then
//! answers with [`Synced::resume`] or [`Synced::stop`]. Both directions use
//! zero-capacity channels, so a handshake never runs ahead of its answer and
//! the two sides strictly alternate.

use crossbeam_channel::{bounded, Receiver, RecvError, Sender, TryRecvError};

/// Answer a consumer gives a worker at a sync point.
#[derive(Clone, Debug, PartialEq)]
pub enum Command<T> {
    /// Run the next unit of work with this input.
    Continue(T),
    Stop,
}

/// The other side of a rendezvous has gone away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Disconnected;

/// Creates a connected producer/consumer pair.
pub fn rendezvous<Out, In>() -> (Producer<Out, In>, Consumer<Out, In>) {
    let (synced_tx, synced_rx) = bounded(0);
    let (command_tx, command_rx) = bounded(0);
    (
        Producer {
            synced: synced_tx,
            commands: command_rx,
        },
        Consumer {
            synced: synced_rx,
            commands: command_tx,
        },
    )
}

/// Worker half of a rendezvous.
pub struct Producer<Out, In> {
    synced: Sender<Out>,
    commands: Receiver<Command<In>>,
}

impl<Out, In> Producer<Out, In> {
    /// Hands `output` to the consumer and waits for its answer.
    pub fn sync(&self, output: Out) -> Result<Command<In>, Disconnected> {
        self.synced.send(output).map_err(|_| Disconnected)?;
        self.commands.recv().map_err(|_| Disconnected)
    }
}

/// Consumer half of a rendezvous.
pub struct Consumer<Out, In> {
    synced: Receiver<Out>,
    commands: Sender<Command<In>>,
}

impl<Out, In> Consumer<Out, In> {
    /// Blocks until the worker reaches its sync point.
    pub fn receive(&self) -> Result<Synced<'_, Out, In>, Disconnected> {
        let output = self.synced.recv().map_err(|_: RecvError| Disconnected)?;
        Ok(Synced {
            output: Some(output),
            commands: &self.commands,
            answered: false,
        })
    }

    /// Takes the worker's output only if it is already waiting.
    pub fn try_receive(&self) -> Result<Option<Synced<'_, Out, In>>, Disconnected> {
        match self.synced.try_recv() {
            Ok(output) => Ok(Some(Synced {
                output: Some(output),
                commands: &self.commands,
                answered: false,
            })),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Disconnected),
        }
    }
}

/// A worker parked at its sync point.
///
/// The worker stays blocked until this is answered. Dropping it unanswered
/// stops the worker.
#[must_use = "the worker stays blocked until it is resumed or stopped"]
pub struct Synced<'a, Out, In> {
    output: Option<Out>,
    commands: &'a Sender<Command<In>>,
    answered: bool,
}

impl<Out, In> Synced<'_, Out, In> {
    /// Output handed over at this sync point.
    pub fn output(&self) -> Option<&Out> {
        self.output.as_ref()
    }

    /// Moves the output out, leaving the worker parked.
    pub fn take_output(&mut self) -> Option<Out> {
        self.output.take()
    }

    /// Lets the worker continue with `input`.
    pub fn resume(mut self, input: In) -> Result<(), Disconnected> {
        self.answer(Command::Continue(input))
    }

    /// Tells the worker to finish.
    pub fn stop(mut self) -> Result<(), Disconnected> {
        self.answer(Command::Stop)
    }

    fn answer(&mut self, command: Command<In>) -> Result<(), Disconnected> {
        self.answered = true;
        self.commands.send(command).map_err(|_| Disconnected)
    }
}

impl<Out, In> Drop for Synced<'_, Out, In> {
    fn drop(&mut self) {
        if !self.answered {
            let _ = self.answer(Command::Stop);
        }
    }
}
