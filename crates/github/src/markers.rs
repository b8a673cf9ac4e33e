//! Machine-readable markers embedded in issue and comment bodies.
//!
//! GitHub has no field for a sub-work-item's sibling dependencies or for a
//! lock marker, so both travel as HTML comments that GitHub does not render.
//! Lock claims are append-only: every acquisition, override and release is a
//! new comment, and GitHub assigns comment ids in commit order.

use serde::{Deserialize, Serialize};

use pipeline::{CommentId, LockMarker, StoredComment, SubWorkItemId};

const LINK_OPEN: &str = "<!-- cogworks:sub-work-item ";
const LOCK_OPEN: &str = "<!-- cogworks:lock ";
const CLOSE: &str = " -->";

/// Dependencies of a sub-work-item, stored at the end of its body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkMarker {
    pub parent: u64,
    #[serde(default)]
    pub depends_on: Vec<SubWorkItemId>,
}

/// Appends the link marker to a sub-work-item body.
pub fn with_link(body: &str, link: &LinkMarker) -> String {
    let json = serde_json::to_string(link).unwrap_or_default();
    format!("{}\n\n{LINK_OPEN}{json}{CLOSE}\n", body.trim_end())
}

/// Splits an issue body into its visible text and its link marker.
pub fn split_link(body: &str) -> (String, Option<LinkMarker>) {
    let Some(start) = body.rfind(LINK_OPEN) else {
        return (body.to_string(), None);
    };
    let rest = &body[start + LINK_OPEN.len()..];
    let marker = rest
        .find(CLOSE)
        .and_then(|end| serde_json::from_str(&rest[..end]).ok());
    match marker {
        Some(marker) => (body[..start].trim_end().to_string(), Some(marker)),
        None => (body.to_string(), None),
    }
}

/// One transition of the processing lock, written as its own comment.
///
/// Claims form a chain: each names the claim it supersedes (`None` for the
/// first). When several claims name the same predecessor the one with the
/// lowest comment id wins and the others are dead branches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockClaim {
    pub supersedes: Option<CommentId>,
    /// The new marker; `None` releases the lock.
    pub marker: Option<LockMarker>,
}

/// The body of a lock claim comment.
pub fn claim_body(claim: &LockClaim) -> String {
    let json = serde_json::to_string(claim).unwrap_or_else(|_| "null".to_string());
    let text = match &claim.marker {
        Some(m) => format!("CogWorks is processing this item (since {}).", m.acquired_at),
        None => "CogWorks is idle on this item.".to_string(),
    };
    format!("{text}\n\n{LOCK_OPEN}{json}{CLOSE}")
}

/// Reads a lock claim from a comment body.
pub fn parse_claim(body: &str) -> Option<LockClaim> {
    let start = body.find(LOCK_OPEN)?;
    let rest = &body[start + LOCK_OPEN.len()..];
    let end = rest.find(CLOSE)?;
    serde_json::from_str(&rest[..end]).ok()
}

fn claims(comments: &[StoredComment]) -> Vec<(CommentId, LockClaim)> {
    comments
        .iter()
        .filter(|c| c.authored_by_engine)
        .filter_map(|c| parse_claim(&c.body).map(|claim| (c.id, claim)))
        .collect()
}

/// The claim that won the right to supersede `previous`. A successor is
/// always newer than its predecessor, so the chain cannot loop.
fn successor(
    claims: &[(CommentId, LockClaim)],
    previous: Option<CommentId>,
) -> Option<&(CommentId, LockClaim)> {
    claims
        .iter()
        .filter(|(id, claim)| claim.supersedes == previous && previous.map_or(true, |p| *id > p))
        .min_by_key(|(id, _)| *id)
}

/// The comment id of the claim that won the right to supersede `previous`.
pub fn winning_claim(comments: &[StoredComment], previous: Option<CommentId>) -> Option<CommentId> {
    successor(&claims(comments), previous).map(|(id, _)| *id)
}

/// The head of the claim chain and the marker it holds.
pub fn current_lock(comments: &[StoredComment]) -> Option<(CommentId, Option<LockMarker>)> {
    let claims = claims(comments);
    let mut head = successor(&claims, None)?;
    while let Some(next) = successor(&claims, Some(head.0)) {
        head = next;
    }
    Some((head.0, head.1.marker.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::{InvocationId, Timestamp};

    #[test]
    fn link_marker_survives_the_body() {
        let link = LinkMarker {
            parent: 42,
            depends_on: vec![SubWorkItemId::new(43)],
        };
        let body = with_link("Wire the motor.\n", &link);
        assert!(body.starts_with("Wire the motor.\n\n<!-- cogworks:sub-work-item "));

        let (text, parsed) = split_link(&body);
        assert_eq!(text, "Wire the motor.");
        assert_eq!(parsed, Some(link));
        assert_eq!(split_link("plain"), ("plain".to_string(), None));
    }

    fn marker() -> LockMarker {
        LockMarker {
            holder: InvocationId::new_random(),
            acquired_at: Timestamp::now(),
        }
    }

    fn claim(id: u64, supersedes: Option<u64>, marker: Option<&LockMarker>) -> StoredComment {
        StoredComment {
            id: CommentId::new(id),
            body: claim_body(&LockClaim {
                supersedes: supersedes.map(CommentId::new),
                marker: marker.cloned(),
            }),
            created_at: Timestamp::now(),
            authored_by_engine: true,
        }
    }

    #[test]
    fn claim_comment_distinguishes_held_and_released() {
        let held = LockClaim {
            supersedes: Some(CommentId::new(7)),
            marker: Some(marker()),
        };
        assert_eq!(parse_claim(&claim_body(&held)), Some(held));
        let released = LockClaim {
            supersedes: None,
            marker: None,
        };
        assert!(claim_body(&released).starts_with("CogWorks is idle"));
        assert_eq!(parse_claim(&claim_body(&released)), Some(released));
        assert_eq!(parse_claim("a human comment"), None);
    }

    #[test]
    fn lowest_claim_on_a_predecessor_wins() {
        let (a, b, c) = (marker(), marker(), marker());
        // 1 holds a; 5 and 6 both override it; 6 then releases its own claim.
        let comments = vec![
            claim(1, None, Some(&a)),
            claim(5, Some(1), Some(&b)),
            claim(6, Some(1), Some(&c)),
            claim(7, Some(6), None),
        ];
        assert_eq!(winning_claim(&comments, Some(CommentId::new(1))), Some(CommentId::new(5)));
        assert_eq!(current_lock(&comments), Some((CommentId::new(5), Some(b.clone()))));

        let mut released = comments.clone();
        released.push(claim(9, Some(5), None));
        assert_eq!(current_lock(&released), Some((CommentId::new(9), None)));
    }

    #[test]
    fn racing_first_claims_and_forged_claims() {
        let (a, b) = (marker(), marker());
        let mut forged = claim(2, None, Some(&b));
        forged.authored_by_engine = false;
        let comments = vec![forged, claim(3, None, Some(&a)), claim(4, None, Some(&b))];
        assert_eq!(current_lock(&comments), Some((CommentId::new(3), Some(a))));
        assert_eq!(current_lock(&[]), None);
    }

    #[test]
    fn a_claim_older_than_its_predecessor_is_ignored() {
        let a = marker();
        let comments = vec![claim(4, Some(8), None), claim(8, None, Some(&a))];
        assert_eq!(current_lock(&comments), Some((CommentId::new(8), Some(a))));
    }
}
