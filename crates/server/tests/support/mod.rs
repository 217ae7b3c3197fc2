//! Shared test harness: in-process servers on ephemeral ports plus a small
//! USB/IP test client speaking the real wire protocol.

use devices::Catalog;
use server::{ApiServer, ServerState, UsbIpServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use usbip::types::{CmdSubmit, ExportedDevice, UrbHeader};
use usbip::{OpRequest, UrbReply, UrbRequest};

pub struct TestServer {
    pub state: Arc<ServerState>,
    pub api_addr: String,
    pub usbip_addr: String,
}

/// Start API + USB/IP servers with the given device connect timeout.
pub async fn start_test_server(connect_timeout: Duration) -> TestServer {
    let state = Arc::new(ServerState::new(
        Arc::new(Catalog::with_builtin()),
        connect_timeout,
    ));

    let api_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let usbip_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let api_addr = api_listener.local_addr().unwrap().to_string();
    let usbip_addr = usbip_listener.local_addr().unwrap().to_string();

    tokio::spawn(ApiServer::new(state.clone(), Duration::from_secs(5)).run(api_listener));
    tokio::spawn(UsbIpServer::new(state.clone(), Duration::from_secs(5)).run(usbip_listener));

    TestServer {
        state,
        api_addr,
        usbip_addr,
    }
}

pub struct UsbIpClient {
    addr: String,
}

impl UsbIpClient {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
        }
    }

    pub async fn list_devices(&self) -> Vec<ExportedDevice> {
        let mut socket = TcpStream::connect(&self.addr).await.unwrap();
        usbip::write_op_request(&mut socket, &OpRequest::DevList)
            .await
            .unwrap();
        usbip::read_devlist_reply(&mut socket).await.unwrap()
    }

    /// Import `busid`; returns the URB-mode connection on success, or the
    /// reply status on failure.
    pub async fn import(&self, busid: &str) -> Result<Import, u32> {
        let mut socket = TcpStream::connect(&self.addr).await.unwrap();
        usbip::write_op_request(
            &mut socket,
            &OpRequest::Import {
                busid: busid.to_string(),
            },
        )
        .await
        .unwrap();
        let (status, device) = usbip::read_import_reply(&mut socket).await.unwrap();
        match device {
            Some(device) if status == usbip::ST_OK => Ok(Import {
                conn: socket,
                devid: (device.busnum << 16) | device.devnum,
                next_seqnum: 1,
            }),
            _ => Err(status),
        }
    }
}

#[derive(Debug)]
pub struct Import {
    pub conn: TcpStream,
    pub devid: u32,
    next_seqnum: u32,
}

impl Import {
    fn seqnum(&mut self) -> u32 {
        let seqnum = self.next_seqnum;
        self.next_seqnum += 1;
        seqnum
    }

    async fn send(&mut self, request: &UrbRequest) {
        usbip::write_urb_request(&mut self.conn, request).await.unwrap();
    }

    pub async fn read_reply(&mut self) -> UrbReply {
        usbip::read_urb_reply(&mut self.conn).await.unwrap()
    }

    /// Submit an interrupt-IN URB without waiting for the reply.
    pub async fn submit_in(&mut self, ep: u32, buffer_length: u32) -> u32 {
        let seqnum = self.seqnum();
        let request = UrbRequest::Submit {
            header: UrbHeader {
                command: usbip::CMD_SUBMIT,
                seqnum,
                devid: self.devid,
                direction: usbip::DIR_IN,
                ep,
            },
            cmd: CmdSubmit {
                transfer_flags: 0,
                transfer_buffer_length: buffer_length,
                start_frame: 0,
                number_of_packets: 0,
                interval: 4,
                setup: [0; 8],
            },
            data: vec![],
        };
        self.send(&request).await;
        seqnum
    }

    /// Submit an OUT URB and wait for its completion status.
    pub async fn submit_out(&mut self, ep: u32, data: &[u8]) -> i32 {
        let seqnum = self.seqnum();
        let request = UrbRequest::Submit {
            header: UrbHeader {
                command: usbip::CMD_SUBMIT,
                seqnum,
                devid: self.devid,
                direction: usbip::DIR_OUT,
                ep,
            },
            cmd: CmdSubmit {
                transfer_flags: 0,
                transfer_buffer_length: data.len() as u32,
                start_frame: 0,
                number_of_packets: 0,
                interval: 4,
                setup: [0; 8],
            },
            data: data.to_vec(),
        };
        self.send(&request).await;
        match self.read_reply().await {
            UrbReply::Submit { header, ret, .. } => {
                assert_eq!(header.seqnum, seqnum);
                ret.status
            }
            other => panic!("expected RET_SUBMIT, got {:?}", other),
        }
    }

    /// Control-IN transfer on EP0; returns (status, data).
    pub async fn control_in(&mut self, setup: [u8; 8], buffer_length: u32) -> (i32, Vec<u8>) {
        let seqnum = self.seqnum();
        let request = UrbRequest::Submit {
            header: UrbHeader {
                command: usbip::CMD_SUBMIT,
                seqnum,
                devid: self.devid,
                direction: usbip::DIR_IN,
                ep: 0,
            },
            cmd: CmdSubmit {
                transfer_flags: 0,
                transfer_buffer_length: buffer_length,
                start_frame: 0,
                number_of_packets: 0,
                interval: 0,
                setup,
            },
            data: vec![],
        };
        self.send(&request).await;
        match self.read_reply().await {
            UrbReply::Submit { header, ret, data } => {
                assert_eq!(header.seqnum, seqnum);
                (ret.status, data)
            }
            other => panic!("expected RET_SUBMIT, got {:?}", other),
        }
    }

    /// Unlink a previously submitted URB; returns the RET_UNLINK status.
    pub async fn unlink(&mut self, target_seqnum: u32) -> i32 {
        let seqnum = self.seqnum();
        let request = UrbRequest::Unlink {
            header: UrbHeader {
                command: usbip::CMD_UNLINK,
                seqnum,
                devid: self.devid,
                direction: usbip::DIR_OUT,
                ep: 0,
            },
            unlink_seqnum: target_seqnum,
        };
        self.send(&request).await;
        loop {
            match self.read_reply().await {
                UrbReply::Unlink { header, ret } => {
                    assert_eq!(header.seqnum, seqnum);
                    return ret.status;
                }
                // A racing RET_SUBMIT for the unlinked URB may arrive first.
                UrbReply::Submit { .. } => continue,
            }
        }
    }

    /// Poll interrupt-IN reports until one matches `want` (with `mask`
    /// deciding which bytes take part in the comparison), or the deadline
    /// passes.
    pub async fn poll_input_report(
        &mut self,
        ep: u32,
        want: &[u8],
        mask: impl Fn(usize) -> bool,
        timeout: Duration,
    ) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut last = Vec::new();
        loop {
            let seqnum = self.submit_in(ep, want.len() as u32).await;
            let reply = tokio::time::timeout_at(deadline, self.read_reply())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for report, last={:02x?}", last));
            let UrbReply::Submit { header, ret, data } = reply else {
                panic!("expected RET_SUBMIT");
            };
            assert_eq!(header.seqnum, seqnum);
            assert_eq!(ret.status, 0, "IN URB failed: {}", ret.status);
            last = data.clone();
            if data.len() == want.len()
                && want
                    .iter()
                    .enumerate()
                    .all(|(i, &b)| !mask(i) || data[i] == b)
            {
                return data;
            }
            assert!(
                Instant::now() < deadline,
                "no matching report, last={:02x?} want={:02x?}",
                last,
                want
            );
        }
    }
}

/// GET_DESCRIPTOR setup packet.
pub fn get_descriptor_setup(desc_type: u8, index: u8, w_index: u16, w_length: u16) -> [u8; 8] {
    let value = ((desc_type as u16) << 8) | index as u16;
    let mut setup = [0u8; 8];
    setup[0] = 0x80;
    setup[1] = 0x06;
    setup[2..4].copy_from_slice(&value.to_le_bytes());
    setup[4..6].copy_from_slice(&w_index.to_le_bytes());
    setup[6..8].copy_from_slice(&w_length.to_le_bytes());
    setup
}
