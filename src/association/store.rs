//! Outbound store association for C-MOVE destinations.
//!
//! [`StoreAssociation`] establishes a client association towards the
//! move destination and carries out C-STORE sub-operations over it,
//! one request/response turnaround at a time.

use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{mpsc, Mutex};

use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom_ul::association::{ClientAssociation, ClientAssociationOptions};
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use snafu::prelude::*;
use tracing::{debug, warn};

use crate::command;
use crate::error::WriteError;

use super::{Association, CancelToken, SubOpRsp, SubOperation};

/// Options for establishing an outbound store association.
///
/// One presentation context is proposed per SOP class and transfer
/// syntax pair added through
/// [`with_presentation_context`](Self::with_presentation_context).
#[derive(Debug, Clone)]
pub struct StoreAssociationOptions {
    calling_ae_title: String,
    called_ae_title: String,
    address: String,
    max_pdu_length: u32,
    presentation_contexts: Vec<(String, Vec<String>)>,
}

impl StoreAssociationOptions {
    /// Start options for the given destination socket address
    /// and AE title.
    pub fn new(address: impl Into<String>, called_ae_title: impl Into<String>) -> Self {
        StoreAssociationOptions {
            calling_ae_title: "STORE-SCU".to_string(),
            called_ae_title: called_ae_title.into(),
            address: address.into(),
            max_pdu_length: 16_384,
            presentation_contexts: Vec::new(),
        }
    }

    /// Set the calling AE title.
    pub fn calling_ae_title(mut self, aet: impl Into<String>) -> Self {
        self.calling_ae_title = aet.into();
        self
    }

    /// Set the maximum PDU length to announce.
    pub fn max_pdu_length(mut self, length: u32) -> Self {
        self.max_pdu_length = length;
        self
    }

    /// Propose a presentation context for the given SOP class
    /// and transfer syntaxes.
    pub fn with_presentation_context(
        mut self,
        sop_class_uid: impl Into<String>,
        transfer_syntaxes: Vec<String>,
    ) -> Self {
        self.presentation_contexts
            .push((sop_class_uid.into(), transfer_syntaxes));
        self
    }

    /// Establish the association.
    pub fn establish(self) -> Result<StoreAssociation, WriteError> {
        ensure_whatever!(
            !self.presentation_contexts.is_empty(),
            "No presentation contexts to propose",
        );
        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(self.calling_ae_title)
            .called_ae_title(self.called_ae_title.clone())
            .max_pdu_length(self.max_pdu_length);
        // presentation context IDs are assigned odd and in
        // proposal order, which lets us map them back to SOP classes
        let mut sop_class_by_pc_id = HashMap::new();
        for (i, (sop_class_uid, transfer_syntaxes)) in
            self.presentation_contexts.into_iter().enumerate()
        {
            let pc_id = (i as u8) * 2 + 1;
            sop_class_by_pc_id.insert(pc_id, sop_class_uid.clone());
            options = options.with_presentation_context(sop_class_uid, transfer_syntaxes);
        }
        let client = options
            .establish_with(&self.address)
            .whatever_context("Failed to establish store association")?;
        debug!(
            "Store association established with {} at {}",
            self.called_ae_title, self.address
        );
        Ok(StoreAssociation {
            remote_ae_title: self.called_ae_title,
            sop_class_by_pc_id,
            message_id: AtomicU16::new(1),
            client: Mutex::new(Some(client)),
        })
    }
}

/// An established association towards a store SCP,
/// ready to carry out C-STORE sub-operations.
pub struct StoreAssociation {
    remote_ae_title: String,
    sop_class_by_pc_id: HashMap<u8, String>,
    message_id: AtomicU16,
    client: Mutex<Option<ClientAssociation<TcpStream>>>,
}

impl StoreAssociation {
    fn select_context(
        &self,
        client: &ClientAssociation<TcpStream>,
        sop_class_uid: &str,
        transfer_syntax_uid: &str,
    ) -> Result<u8, WriteError> {
        client
            .presentation_contexts()
            .iter()
            .find(|pc| {
                pc.transfer_syntax.trim_end_matches('\0') == transfer_syntax_uid
                    && self
                        .sop_class_by_pc_id
                        .get(&pc.id)
                        .map(|uid| uid == sop_class_uid)
                        .unwrap_or(false)
            })
            .map(|pc| pc.id)
            .context(crate::error::NoAcceptedPresentationContextSnafu {
                sop_class_uid: sop_class_uid.to_string(),
                transfer_syntax_uid: transfer_syntax_uid.to_string(),
            })
    }

    fn send_message(
        client: &mut ClientAssociation<TcpStream>,
        pc_id: u8,
        cmd: &InMemDicomObject,
        data: Option<&[u8]>,
    ) -> Result<(), WriteError> {
        let mut cmd_data = Vec::with_capacity(128);
        cmd.write_dataset_with_ts(&mut cmd_data, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .map_err(Box::new)
            .context(crate::error::EncodeSnafu)?;

        match data {
            Some(data)
                if cmd_data.len() + data.len()
                    < client.acceptor_max_pdu_length().saturating_sub(100) as usize =>
            {
                client
                    .send(&Pdu::PData {
                        data: vec![
                            PDataValue {
                                presentation_context_id: pc_id,
                                value_type: PDataValueType::Command,
                                is_last: true,
                                data: cmd_data,
                            },
                            PDataValue {
                                presentation_context_id: pc_id,
                                value_type: PDataValueType::Data,
                                is_last: true,
                                data: data.to_vec(),
                            },
                        ],
                    })
                    .whatever_context("Failed to send C-STORE-RQ")?;
            }
            Some(data) => {
                client
                    .send(&Pdu::PData {
                        data: vec![PDataValue {
                            presentation_context_id: pc_id,
                            value_type: PDataValueType::Command,
                            is_last: true,
                            data: cmd_data,
                        }],
                    })
                    .whatever_context("Failed to send C-STORE-RQ command")?;
                client
                    .send_pdata(pc_id)
                    .write_all(data)
                    .whatever_context("Failed to send C-STORE-RQ data set")?;
            }
            None => {
                client
                    .send(&Pdu::PData {
                        data: vec![PDataValue {
                            presentation_context_id: pc_id,
                            value_type: PDataValueType::Command,
                            is_last: true,
                            data: cmd_data,
                        }],
                    })
                    .whatever_context("Failed to send command")?;
            }
        }
        Ok(())
    }

    fn receive_status(client: &mut ClientAssociation<TcpStream>) -> Result<u16, WriteError> {
        let pdu = client
            .receive()
            .whatever_context("Failed to receive C-STORE-RSP")?;
        match pdu {
            Pdu::PData { data } => {
                let data_value = data
                    .first()
                    .whatever_context::<_, WriteError>("Empty P-Data response")?;
                let cmd = InMemDicomObject::read_dataset_with_ts(
                    &data_value.data[..],
                    &IMPLICIT_VR_LITTLE_ENDIAN.erased(),
                )
                .whatever_context("Could not read response command set")?;
                cmd.element(tags::STATUS)
                    .ok()
                    .and_then(|e| e.to_int::<u16>().ok())
                    .whatever_context("Missing status code in response")
            }
            pdu => {
                whatever!("Unexpected response PDU: {:?}", pdu)
            }
        }
    }
}

impl Association for StoreAssociation {
    fn write_rsp(
        &self,
        presentation_context_id: u8,
        cmd: InMemDicomObject,
        data: Option<InMemDicomObject>,
    ) -> Result<(), WriteError> {
        let mut guard = self
            .client
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let client = guard.as_mut().context(crate::error::NotReadySnafu)?;
        let data = match data {
            Some(obj) => {
                let mut bytes = Vec::with_capacity(2048);
                obj.write_dataset_with_ts(&mut bytes, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
                    .map_err(Box::new)
                    .context(crate::error::EncodeSnafu)?;
                Some(bytes)
            }
            None => None,
        };
        Self::send_message(client, presentation_context_id, &cmd, data.as_deref())
    }

    fn next_message_id(&self) -> u16 {
        self.message_id.fetch_add(1, Ordering::Relaxed)
    }

    fn is_ready_for_data_transfer(&self) -> bool {
        self.client
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    fn remote_ae_title(&self) -> String {
        self.remote_ae_title.clone()
    }

    // a store SCU association does not read requests,
    // so there is nothing to dispatch a C-CANCEL-RQ from
    fn register_cancel(&self, _message_id: u16, _token: CancelToken) {}

    fn unregister_cancel(&self, _message_id: u16) {}

    fn cstore(
        &self,
        sub_op: SubOperation,
        rsp_tx: mpsc::Sender<SubOpRsp>,
    ) -> Result<(), WriteError> {
        let mut guard = self
            .client
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let client = guard.as_mut().context(crate::error::NotReadySnafu)?;
        let pc_id =
            self.select_context(client, &sub_op.sop_class_uid, &sub_op.transfer_syntax_uid)?;

        let cmd = command::store_rq(
            &sub_op.sop_class_uid,
            &sub_op.sop_instance_uid,
            sub_op.message_id,
            sub_op.priority,
            sub_op
                .originator
                .as_ref()
                .map(|o| (o.ae_title.as_str(), o.message_id)),
        );
        let outcome = Self::send_message(client, pc_id, &cmd, Some(&sub_op.data))
            .and_then(|_| Self::receive_status(client));
        match outcome {
            Ok(rsp_status) => {
                // receiver may already have given up waiting
                let _ = rsp_tx.send(SubOpRsp {
                    sop_instance_uid: sub_op.sop_instance_uid,
                    status: rsp_status,
                });
                Ok(())
            }
            Err(e) => {
                // the association is no longer usable; the submitter
                // accounts for this sub-operation through the error,
                // so no response message may be delivered for it
                if let Some(client) = guard.take() {
                    let _ = client.abort();
                }
                Err(e)
            }
        }
    }

    fn release(&self) {
        let client = self
            .client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(client) = client {
            if let Err(e) = client.release() {
                warn!("Failed to release store association: {}", e);
            }
        }
    }
}
