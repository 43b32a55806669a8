//! Typed views over server replies
//!
//! Every reply is parsed once into a [`ReplyHeader`]; command-specific bodies
//! are read through [`CursorReply`] and [`WriteReply`].

use std::collections::VecDeque;

use bson::{Bson, Document, Timestamp};

use causeway_common::error::{CommandError, Error, Result, WriteConcernError, WriteError};
use causeway_common::types::{CursorId, Namespace};

use crate::clock::ClusterTime;

/// Read an integer field stored as Int32, Int64 or Double
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn get_int(doc: &Document, key: &str) -> Option<i64> {
    match doc.get(key)? {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) => Some(*v as i64),
        _ => None,
    }
}

fn get_code(doc: &Document) -> i32 {
    get_int(doc, "code")
        .and_then(|c| i32::try_from(c).ok())
        .unwrap_or_default()
}

fn get_string(doc: &Document, key: &str) -> String {
    doc.get_str(key).unwrap_or_default().to_string()
}

fn get_labels(doc: &Document) -> Vec<String> {
    doc.get_array("errorLabels")
        .map(|labels| {
            labels
                .iter()
                .filter_map(|l| l.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn is_ok(doc: &Document) -> bool {
    match doc.get("ok") {
        Some(Bson::Boolean(b)) => *b,
        Some(Bson::Int32(v)) => *v == 1,
        Some(Bson::Int64(v)) => *v == 1,
        Some(Bson::Double(v)) => *v > 0.5,
        _ => false,
    }
}

/// Fields common to every reply
#[derive(Debug, Clone, Default)]
pub struct ReplyHeader {
    pub ok: bool,
    pub operation_time: Option<Timestamp>,
    pub cluster_time: Option<ClusterTime>,
    pub recovery_token: Option<Document>,
    pub labels: Vec<String>,
    pub code: i32,
    pub code_name: String,
    pub errmsg: String,
    pub write_error: Option<WriteError>,
    pub write_concern_error: Option<WriteConcernError>,
}

impl ReplyHeader {
    pub fn parse(reply: &Document) -> Self {
        let labels = get_labels(reply);

        let write_error = reply
            .get_array("writeErrors")
            .ok()
            .and_then(|errors| errors.first())
            .and_then(Bson::as_document)
            .map(|e| WriteError {
                index: get_int(e, "index")
                    .and_then(|i| i32::try_from(i).ok())
                    .unwrap_or_default(),
                code: get_code(e),
                message: get_string(e, "errmsg"),
            });

        let write_concern_error = reply.get_document("writeConcernError").ok().map(|wce| {
            let mut wce_labels = get_labels(wce);
            for label in &labels {
                if !wce_labels.contains(label) {
                    wce_labels.push(label.clone());
                }
            }
            WriteConcernError {
                code: get_code(wce),
                code_name: get_string(wce, "codeName"),
                message: get_string(wce, "errmsg"),
                labels: wce_labels,
            }
        });

        Self {
            ok: is_ok(reply),
            operation_time: reply.get_timestamp("operationTime").ok(),
            cluster_time: reply
                .get_document("$clusterTime")
                .ok()
                .and_then(|ct| ClusterTime::from_document(ct.clone())),
            recovery_token: reply.get_document("recoveryToken").ok().cloned(),
            code: get_code(reply),
            code_name: get_string(reply, "codeName"),
            errmsg: get_string(reply, "errmsg"),
            labels,
            write_error,
            write_concern_error,
        }
    }

    /// The error this reply reports. `ok: 0` wins over write errors, which win
    /// over a write concern error.
    pub fn error(&self) -> Option<Error> {
        if !self.ok {
            return Some(Error::Command(CommandError {
                code: self.code,
                code_name: self.code_name.clone(),
                message: self.errmsg.clone(),
                labels: self.labels.clone(),
            }));
        }
        if let Some(we) = &self.write_error {
            return Some(Error::Write(we.clone()));
        }
        self.write_concern_error.clone().map(Error::WriteConcern)
    }
}

/// The `cursor` sub-document of find, aggregate and getMore replies
#[derive(Debug, Clone)]
pub struct CursorReply {
    pub id: CursorId,
    pub namespace: Option<Namespace>,
    pub batch: VecDeque<Document>,
    pub post_batch_resume_token: Option<Document>,
}

impl CursorReply {
    pub fn parse(reply: &Document) -> Result<Self> {
        let cursor = reply
            .get_document("cursor")
            .map_err(|_| Error::InvalidResponse("reply has no cursor document".to_string()))?;

        let id = get_int(cursor, "id")
            .ok_or_else(|| Error::InvalidResponse("cursor reply has no id".to_string()))?;

        let batch = cursor
            .get_array("firstBatch")
            .or_else(|_| cursor.get_array("nextBatch"))
            .map_err(|_| Error::InvalidResponse("cursor reply has no batch".to_string()))?
            .iter()
            .map(|doc| match doc {
                Bson::Document(d) => Ok(d.clone()),
                other => Err(Error::InvalidResponse(format!(
                    "cursor batch entry is not a document: {other}"
                ))),
            })
            .collect::<Result<VecDeque<_>>>()?;

        Ok(Self {
            id,
            namespace: cursor.get_str("ns").ok().and_then(Namespace::parse),
            batch,
            post_batch_resume_token: cursor.get_document("postBatchResumeToken").ok().cloned(),
        })
    }
}

/// Body of insert, update, delete and findAndModify replies
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteReply {
    pub n: i64,
    pub n_modified: Option<i64>,
    pub upserted_id: Option<Bson>,
    /// `value` of a findAndModify reply
    pub value: Option<Document>,
}

impl WriteReply {
    pub fn parse(reply: &Document) -> Self {
        let upserted_id = reply
            .get_array("upserted")
            .ok()
            .and_then(|u| u.first())
            .and_then(Bson::as_document)
            .and_then(|u| u.get("_id").cloned())
            .or_else(|| {
                reply
                    .get_document("lastErrorObject")
                    .ok()
                    .and_then(|le| le.get("upserted").cloned())
            });

        Self {
            n: get_int(reply, "n")
                .or_else(|| {
                    reply
                        .get_document("lastErrorObject")
                        .ok()
                        .and_then(|le| get_int(le, "n"))
                })
                .unwrap_or_default(),
            n_modified: get_int(reply, "nModified"),
            upserted_id,
            value: reply.get_document("value").ok().cloned(),
        }
    }
}
