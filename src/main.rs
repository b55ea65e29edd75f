fn main() -> anyhow::Result<()> {
    motion_collector::run()
}
