//! Which server sessions a directory store lists.

use std::collections::HashSet;
use std::time::Duration;

use tether_types::{Project, Session};

use crate::path::normalize;
use crate::reconcile::sorted_unique;

/// Inputs to the list policy for one directory.
#[derive(Debug, Clone)]
pub struct SessionListPolicy<'a> {
    /// The store's directory as the caller opened it.
    pub directory: &'a str,
    pub project: Option<&'a Project>,
    /// The server's default working directory, from the global path info.
    pub global_directory: Option<&'a str>,
    pub limit: usize,
    pub recent_window: Duration,
    pub now_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPage {
    pub sessions: Vec<Session>,
    /// More sessions matched than the window shows.
    pub has_more: bool,
}

impl SessionListPolicy<'_> {
    pub fn apply(&self, sessions: Vec<Session>) -> SessionPage {
        let listed: Vec<Session> = sessions
            .into_iter()
            .filter(|s| !s.id.trim().is_empty())
            .filter(|s| !s.is_archived())
            .collect();
        let listed = sorted_unique(listed);

        let allowed = self.allowed_directories();
        let mut kept: Vec<Session> = listed
            .into_iter()
            .filter(|s| self.is_allowed(s, &allowed))
            .collect();

        for session in &mut kept {
            if session.directory().is_none() && !self.directory.trim().is_empty() {
                session.directory = Some(self.directory.to_string());
            }
        }

        let has_more = kept.len() > self.limit;
        let cutoff = self
            .now_ms
            .saturating_sub(self.recent_window.as_millis() as u64);
        let sessions = kept
            .into_iter()
            .enumerate()
            .filter(|(rank, s)| *rank < self.limit || s.last_activity_ms() >= cutoff)
            .map(|(_, s)| s)
            .collect();

        SessionPage { sessions, has_more }
    }

    /// The store root plus the project's sandboxes. The project worktree only
    /// counts when it is the root.
    fn allowed_directories(&self) -> HashSet<String> {
        let mut allowed = HashSet::new();
        let root = normalize(self.directory);
        if !root.is_empty() {
            allowed.insert(root);
        }
        if let Some(project) = self.project {
            for dir in &project.sandboxes {
                let dir = normalize(dir);
                if !dir.is_empty() {
                    allowed.insert(dir);
                }
            }
        }
        allowed
    }

    fn is_allowed(&self, session: &Session, allowed: &HashSet<String>) -> bool {
        if let Some(own) = session.directory() {
            return allowed.contains(&normalize(own));
        }

        let root = normalize(self.directory);
        let project_resolves = self
            .project
            .is_some_and(|p| !normalize(&p.worktree).is_empty());
        if project_resolves {
            return allowed.contains(&root);
        }

        // Neither the session nor the project names a directory: the store
        // only claims it when it is the server's default workspace.
        let global = self.global_directory.map(normalize).unwrap_or_default();
        global.is_empty() || global == root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_MS: u64 = 60 * 60 * 1000;
    const NOW: u64 = 1_000 * HOUR_MS;

    fn session(id: &str, updated: u64) -> Session {
        let mut s = Session::new(id);
        s.time.created = updated;
        s.time.updated = updated;
        s
    }

    fn policy<'a>(directory: &'a str, project: Option<&'a Project>) -> SessionListPolicy<'a> {
        SessionListPolicy {
            directory,
            project,
            global_directory: None,
            limit: 5,
            recent_window: Duration::from_secs(4 * 60 * 60),
            now_ms: NOW,
        }
    }

    fn ids(page: &SessionPage) -> Vec<&str> {
        page.sessions.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn window_keeps_limit_plus_recent_tail() {
        let sessions: Vec<Session> = (1..=10)
            .map(|rank| {
                let updated = if (6..=8).contains(&rank) {
                    NOW - HOUR_MS
                } else {
                    NOW - 240 * HOUR_MS
                };
                session(&format!("ses_{rank:02}"), updated)
            })
            .collect();

        let page = policy("/srv/app", None).apply(sessions);
        assert_eq!(
            ids(&page),
            vec!["ses_01", "ses_02", "ses_03", "ses_04", "ses_05", "ses_06", "ses_07", "ses_08"]
        );
        assert!(page.has_more);
    }

    #[test]
    fn drops_blank_ids_and_archived_and_sorts() {
        let mut archived = session("ses_b", NOW);
        archived.time.archived = Some(NOW);
        let page = policy("/srv/app", None).apply(vec![
            session("ses_c", NOW),
            session("", NOW),
            archived,
            session("ses_a", NOW),
        ]);
        assert_eq!(ids(&page), vec!["ses_a", "ses_c"]);
        assert!(!page.has_more);
    }

    #[test]
    fn keeps_root_and_sandbox_sessions_only() {
        let mut project = Project::new("prj_1", "/srv/app");
        project.sandboxes.push("/srv/app-sandbox/".to_string());

        let mut in_root = session("ses_1", NOW);
        in_root.directory = Some("/srv/app/".to_string());
        let mut in_sandbox = session("ses_2", NOW);
        in_sandbox.directory = Some("/srv/app-sandbox".to_string());
        let mut elsewhere = session("ses_3", NOW);
        elsewhere.directory = Some("/srv/other".to_string());
        let unscoped = session("ses_4", NOW);

        let page = policy("/srv/app", Some(&project)).apply(vec![
            in_root, in_sandbox, elsewhere, unscoped,
        ]);
        assert_eq!(ids(&page), vec!["ses_1", "ses_2", "ses_4"]);
        assert_eq!(page.sessions[2].directory.as_deref(), Some("/srv/app"));
    }

    #[test]
    fn sandbox_store_does_not_list_worktree_sessions() {
        let mut project = Project::new("prj_1", "/srv/app");
        project.sandboxes.push("/srv/app-sandbox".to_string());

        let mut in_worktree = session("ses_1", NOW);
        in_worktree.directory = Some("/srv/app".to_string());
        let mut in_sandbox = session("ses_2", NOW);
        in_sandbox.directory = Some("/srv/app-sandbox/".to_string());

        let page = policy("/srv/app-sandbox", Some(&project)).apply(vec![in_worktree, in_sandbox]);
        assert_eq!(ids(&page), vec!["ses_2"]);

        let mut only_worktree = session("ses_3", NOW);
        only_worktree.directory = Some("/srv/app".to_string());
        let page = policy("/srv/app-sandbox", Some(&project)).apply(vec![only_worktree]);
        assert!(page.sessions.is_empty());
    }

    #[test]
    fn unresolvable_directory_falls_back_to_global_default() {
        let mut p = policy("/srv/app", None);
        p.global_directory = Some("/home/me");
        assert!(p.apply(vec![session("ses_1", NOW)]).sessions.is_empty());

        p.global_directory = Some("/srv/app/");
        let page = p.apply(vec![session("ses_1", NOW)]);
        assert_eq!(page.sessions.len(), 1);
        assert_eq!(page.sessions[0].directory.as_deref(), Some("/srv/app"));

        p.global_directory = None;
        assert_eq!(p.apply(vec![session("ses_1", NOW)]).sessions.len(), 1);
    }
}
