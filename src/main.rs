fn main() -> anyhow::Result<()> {
    shelf_audit_lib::run()
}
