use crate::Result;

use super::{CommandRunner, args};

const OPENFLOW_PROTOCOL: &str = "OpenFlow13";

/// Queued OVS operations against one bridge. Configuration changes go
/// through `ovs-vsctl`, flow changes through `ovs-ofctl`; everything runs
/// in queue order on `commit`.
pub struct OvsTransaction<'a> {
    runner: &'a dyn CommandRunner,
    bridge: String,
    ops: Vec<Op>,
}

struct Op {
    program: &'static str,
    args: Vec<String>,
    ignore_error: bool,
}

impl<'a> OvsTransaction<'a> {
    pub fn new(runner: &'a dyn CommandRunner, bridge: &str) -> Self {
        Self {
            runner,
            bridge: bridge.to_owned(),
            ops: Vec::new(),
        }
    }

    fn vsctl(&mut self, op_args: Vec<String>) {
        self.ops.push(Op {
            program: "ovs-vsctl",
            args: op_args,
            ignore_error: false,
        });
    }

    fn ofctl(&mut self, mut op_args: Vec<String>) {
        let mut full = args(&["-O", OPENFLOW_PROTOCOL]);
        full.append(&mut op_args);
        self.ops.push(Op {
            program: "ovs-ofctl",
            args: full,
            ignore_error: false,
        });
    }

    pub fn ignore_error(&mut self) {
        if let Some(op) = self.ops.last_mut() {
            op.ignore_error = true;
        }
    }

    pub fn add_bridge(&mut self, properties: &[&str]) {
        let mut op = args(&["add-br", &self.bridge]);
        if !properties.is_empty() {
            op.extend(args(&["--", "set", "Bridge", &self.bridge]));
            op.extend(args(properties));
        }
        self.vsctl(op);
    }

    pub fn delete_bridge(&mut self) {
        self.vsctl(args(&["del-br", &self.bridge]));
    }

    /// Adds a port with a fixed OpenFlow port number so the flow tables
    /// can reference it by constant.
    pub fn add_port(&mut self, port: &str, ofport: u32, properties: &[&str]) {
        let mut op = args(&["add-port", &self.bridge, port, "--", "set", "Interface", port]);
        op.push(format!("ofport_request={ofport}"));
        op.extend(args(properties));
        self.vsctl(op);
    }

    pub fn delete_port(&mut self, port: &str) {
        self.vsctl(args(&["del-port", &self.bridge, port]));
    }

    pub fn add_flow(&mut self, flow: impl Into<String>) {
        let flow = flow.into();
        self.ofctl(vec!["add-flow".to_owned(), self.bridge.clone(), flow]);
    }

    /// Deletes the flows matching `filter`, or every flow when the filter
    /// is empty.
    pub fn delete_flows(&mut self, filter: &str) {
        let mut op = vec!["del-flows".to_owned(), self.bridge.clone()];
        if !filter.is_empty() {
            op.push(filter.to_owned());
        }
        self.ofctl(op);
    }

    /// Immediate query: one line per flow currently on the bridge.
    pub async fn dump_flows(&self) -> Result<Vec<String>> {
        let output = self
            .runner
            .run(
                "ovs-ofctl",
                &args(&["-O", OPENFLOW_PROTOCOL, "dump-flows", &self.bridge]),
            )
            .await?;
        Ok(output.lines().map(|l| l.trim().to_owned()).collect())
    }

    pub async fn commit(self) -> Result<()> {
        for op in &self.ops {
            match self.runner.run(op.program, &op.args).await {
                Ok(_) => {}
                Err(_) if op.ignore_error => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::commands::testing::FakeRunner;

    use super::*;

    #[tokio::test]
    async fn test_bridge_and_port_setup() {
        let runner = FakeRunner::new();
        let mut otx = OvsTransaction::new(&runner, "br0");
        otx.delete_bridge();
        otx.ignore_error();
        otx.add_bridge(&["fail-mode=secure", "protocols=OpenFlow13"]);
        otx.add_port("vxlan0", 1, &["type=vxlan", "options:remote_ip=\"flow\"", "options:key=\"flow\""]);
        otx.add_port("tun0", 2, &["type=internal"]);
        otx.add_port("vovsbr", 3, &[]);
        otx.commit().await.unwrap();

        assert_eq!(
            runner.recorded(),
            vec![
                "ovs-vsctl del-br br0",
                "ovs-vsctl add-br br0 -- set Bridge br0 fail-mode=secure protocols=OpenFlow13",
                "ovs-vsctl add-port br0 vxlan0 -- set Interface vxlan0 ofport_request=1 type=vxlan options:remote_ip=\"flow\" options:key=\"flow\"",
                "ovs-vsctl add-port br0 tun0 -- set Interface tun0 ofport_request=2 type=internal",
                "ovs-vsctl add-port br0 vovsbr -- set Interface vovsbr ofport_request=3",
            ]
        );
    }

    #[tokio::test]
    async fn test_flow_operations_use_openflow13() {
        let runner = FakeRunner::new();
        let mut otx = OvsTransaction::new(&runner, "br0");
        otx.add_flow("table=0, priority=50, actions=output:2");
        otx.delete_flows("table=7,cookie=0x0a010203/0xffffffff");
        otx.delete_flows("");
        otx.commit().await.unwrap();

        assert_eq!(
            runner.recorded(),
            vec![
                "ovs-ofctl -O OpenFlow13 add-flow br0 table=0, priority=50, actions=output:2",
                "ovs-ofctl -O OpenFlow13 del-flows br0 table=7,cookie=0x0a010203/0xffffffff",
                "ovs-ofctl -O OpenFlow13 del-flows br0",
            ]
        );
    }

    #[tokio::test]
    async fn test_dump_flows() {
        let runner = FakeRunner::new();
        runner.stub_output(
            "ovs-ofctl -O OpenFlow13 dump-flows br0",
            "OFPST_FLOW reply (OF1.3):\n cookie=0x0, table=0, priority=50 actions=output:2\n",
        );
        let otx = OvsTransaction::new(&runner, "br0");
        let flows = otx.dump_flows().await.unwrap();
        assert_eq!(flows.len(), 2);
        assert!(flows[1].contains("priority=50"));
    }
}
