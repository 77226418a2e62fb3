use crate::Result;

use super::{CommandRunner, args};

/// Queued iptables rule changes. Rules are installed with
/// delete-then-add so repeated bring-ups never stack duplicates.
pub struct IptablesTransaction<'a> {
    runner: &'a dyn CommandRunner,
    ops: Vec<Vec<String>>,
}

#[derive(Clone, Copy)]
enum Position {
    Append,
    Insert,
}

impl<'a> IptablesTransaction<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            ops: Vec::new(),
        }
    }

    /// Queues the rule at the end of the chain, preceded by a best-effort
    /// delete of any identical rule.
    pub fn ensure_rule(&mut self, table: Option<&str>, chain: &str, rule: &[&str]) {
        self.ensure(table, chain, rule, Position::Append);
    }

    /// Same, but inserts at the head of the chain.
    pub fn ensure_rule_first(&mut self, table: Option<&str>, chain: &str, rule: &[&str]) {
        self.ensure(table, chain, rule, Position::Insert);
    }

    fn ensure(&mut self, table: Option<&str>, chain: &str, rule: &[&str], position: Position) {
        let mut base = Vec::new();
        if let Some(table) = table {
            base.extend(args(&["-t", table]));
        }

        let mut delete = base.clone();
        delete.extend(args(&["-D", chain]));
        delete.extend(args(rule));
        self.ops.push(delete);

        let flag = match position {
            Position::Append => "-A",
            Position::Insert => "-I",
        };
        let mut add = base;
        add.extend(args(&[flag, chain]));
        add.extend(args(rule));
        self.ops.push(add);
    }

    pub async fn commit(self) -> Result<()> {
        let mut ops = self.ops.into_iter();
        while let (Some(delete), Some(add)) = (ops.next(), ops.next()) {
            // the delete leg only clears a pre-existing copy; absence is fine
            let _ = self.runner.run("iptables", &delete).await;
            self.runner.run("iptables", &add).await?;
        }
        Ok(())
    }
}
