use std::time::Duration;

use salbridge_api::{Fields, RemoteId};

use crate::remote::RemoteHandle;
use crate::sequencer::{CommandHandle, CommandRequest, CommandResult};

/// One command issued to several remotes at once.
#[derive(Debug, Clone)]
pub struct GroupHandle {
    members: Vec<(RemoteId, CommandHandle)>,
}

impl GroupHandle {
    pub fn members(&self) -> &[(RemoteId, CommandHandle)] {
        &self.members
    }

    pub fn is_resolved(&self) -> bool {
        self.members.iter().all(|(_, h)| h.is_resolved())
    }

    /// All members completed.
    pub fn succeeded(&self) -> bool {
        self.members.iter().all(|(_, h)| matches!(h.result(), Some(Ok(()))))
    }

    /// Wait for every member; results in issue order.
    pub async fn wait_all(&mut self) -> Vec<(RemoteId, CommandResult)> {
        let mut results = Vec::with_capacity(self.members.len());
        for (remote, handle) in &mut self.members {
            results.push((remote.clone(), handle.wait().await));
        }
        results
    }
}

/// Issue `name` with `args` to every remote in `remotes`. Each member is
/// sequenced independently: busy or disconnected members fail on their
/// own without holding the others back.
pub fn issue_group<'a, I>(remotes: I, name: &str, args: &Fields, timeout: Option<Duration>) -> GroupHandle
where
    I: IntoIterator<Item = &'a mut RemoteHandle>,
{
    let members = remotes
        .into_iter()
        .map(|remote| {
            let mut request = CommandRequest::new(name).args(args.clone());
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }
            (remote.id().clone(), remote.issue_with(request))
        })
        .collect::<Vec<_>>();
    tracing::debug!(command = name, members = members.len(), "group command issued");
    GroupHandle { members }
}
