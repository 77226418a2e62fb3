use crate::Result;

use super::{CommandRunner, args};

/// Queued `ip` operations against one link. Mirrors the shape of the
/// other tool transactions: queue, then `commit` runs everything and
/// returns the first error. `ignore_error` marks the most recently queued
/// operation best-effort, for delete-then-add sequences that must
/// converge on reruns.
pub struct IpTransaction<'a> {
    runner: &'a dyn CommandRunner,
    link: String,
    ops: Vec<Op>,
}

struct Op {
    args: Vec<String>,
    ignore_error: bool,
}

impl<'a> IpTransaction<'a> {
    pub fn new(runner: &'a dyn CommandRunner, link: &str) -> Self {
        Self {
            runner,
            link: link.to_owned(),
            ops: Vec::new(),
        }
    }

    fn push(&mut self, op_args: Vec<String>) {
        self.ops.push(Op {
            args: op_args,
            ignore_error: false,
        });
    }

    /// Marks the most recently queued operation best-effort.
    pub fn ignore_error(&mut self) {
        if let Some(op) = self.ops.last_mut() {
            op.ignore_error = true;
        }
    }

    pub fn add_link(&mut self, extra: &[&str]) {
        let mut op = args(&["link", "add", &self.link]);
        op.extend(args(extra));
        self.push(op);
    }

    pub fn delete_link(&mut self) {
        self.push(args(&["link", "del", &self.link]));
    }

    pub fn set_link(&mut self, extra: &[&str]) {
        let mut op = args(&["link", "set", &self.link]);
        op.extend(args(extra));
        self.push(op);
    }

    pub fn add_address(&mut self, cidr: &str) {
        self.push(args(&["addr", "add", cidr, "dev", &self.link]));
    }

    pub fn add_route(&mut self, cidr: &str, extra: &[&str]) {
        let mut op = args(&["route", "add", cidr, "dev", &self.link]);
        op.extend(args(extra));
        self.push(op);
    }

    pub fn delete_route(&mut self, cidr: &str, extra: &[&str]) {
        let mut op = args(&["route", "del", cidr, "dev", &self.link]);
        op.extend(args(extra));
        self.push(op);
    }

    /// Enslaves another link to this one (this link is the bridge).
    pub fn add_slave(&mut self, slave: &str) {
        self.push(args(&["link", "set", slave, "master", &self.link]));
    }

    /// Immediate query: the addresses currently on the link, in
    /// `address/prefix` form.
    pub async fn get_addresses(&self) -> Result<Vec<String>> {
        let output = self
            .runner
            .run("ip", &args(&["addr", "show", "dev", &self.link]))
            .await?;
        let mut addresses = Vec::new();
        for line in output.lines() {
            let mut words = line.split_whitespace();
            if words.next() == Some("inet")
                && let Some(addr) = words.next()
            {
                addresses.push(addr.to_owned());
            }
        }
        Ok(addresses)
    }

    pub async fn commit(self) -> Result<()> {
        for op in &self.ops {
            match self.runner.run("ip", &op.args).await {
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
    async fn test_queued_operations_run_in_order() {
        let runner = FakeRunner::new();
        let mut itx = IpTransaction::new(&runner, "vlinuxbr");
        itx.delete_link();
        itx.ignore_error();
        itx.add_link(&["type", "veth", "peer", "name", "vovsbr"]);
        itx.set_link(&["up"]);
        itx.set_link(&["txqueuelen", "0"]);
        itx.commit().await.unwrap();

        assert_eq!(
            runner.recorded(),
            vec![
                "ip link del vlinuxbr",
                "ip link add vlinuxbr type veth peer name vovsbr",
                "ip link set vlinuxbr up",
                "ip link set vlinuxbr txqueuelen 0",
            ]
        );
    }

    #[tokio::test]
    async fn test_ignored_failure_does_not_abort() {
        let runner = FakeRunner::new();
        runner.stub_failure("ip link del lbr0", "Cannot find device \"lbr0\"");
        let mut itx = IpTransaction::new(&runner, "lbr0");
        itx.delete_link();
        itx.ignore_error();
        itx.add_link(&["type", "bridge"]);
        itx.commit().await.unwrap();
        assert_eq!(runner.recorded().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_operations() {
        let runner = FakeRunner::new();
        runner.stub_failure("ip link add lbr0 type bridge", "permission denied");
        let mut itx = IpTransaction::new(&runner, "lbr0");
        itx.add_link(&["type", "bridge"]);
        itx.set_link(&["up"]);
        assert!(itx.commit().await.is_err());
        assert_eq!(runner.recorded().len(), 1);
    }

    #[tokio::test]
    async fn test_get_addresses() {
        let runner = FakeRunner::new();
        runner.stub_output(
            "ip addr show dev lbr0",
            "4: lbr0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500\n    \
             inet 10.1.2.1/24 scope global lbr0\n    \
             inet6 fe80::1/64 scope link\n",
        );
        let itx = IpTransaction::new(&runner, "lbr0");
        assert_eq!(itx.get_addresses().await.unwrap(), vec!["10.1.2.1/24"]);
    }
}
